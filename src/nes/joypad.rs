pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

const READ_WRAP: u8 = 24;

/// Both controller ports. The two ports share a single read counter, so
/// polling one advances the other.
#[derive(Debug, Default, Clone)]
pub struct Joypad {
    buttons: [u8; 2],
    strobe: [u8; 2],
    counter: u8,
}

impl Joypad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buttons(&mut self, port: usize, buttons: u8) {
        self.buttons[port & 1] = buttons;
    }

    pub fn buttons(&self, port: usize) -> u8 {
        self.buttons[port & 1]
    }

    /// Presses a button. Opposite directions release each other.
    pub fn press(&mut self, port: usize, button: u8) {
        let opposite = match button {
            BUTTON_UP => BUTTON_DOWN,
            BUTTON_DOWN => BUTTON_UP,
            BUTTON_LEFT => BUTTON_RIGHT,
            BUTTON_RIGHT => BUTTON_LEFT,
            _ => 0,
        };
        let state = &mut self.buttons[port & 1];
        *state = (*state & !opposite) | button;
    }

    pub fn release(&mut self, port: usize, button: u8) {
        self.buttons[port & 1] &= !button;
    }

    pub fn read(&mut self, port: usize) -> u8 {
        let bit = if self.counter < 8 {
            (self.buttons[port & 1] >> self.counter) & 1
        } else {
            0
        };
        self.counter += 1;
        if self.counter == READ_WRAP {
            self.counter = 0;
        }
        bit | 0x40
    }

    pub fn write_strobe(&mut self, port: usize, value: u8) {
        let latch = &mut self.strobe[port & 1];
        if value & 1 == 0 && *latch == 1 {
            self.counter = 0;
        }
        *latch = value & 1;
    }
}
