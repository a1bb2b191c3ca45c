//! Build-time pin catalogs for the board's digital inputs, digital outputs,
//! and analog channels.

/// Digital input pins (S-pins), in sweep order.
pub const S_PINS: [u16; 16] = [
    38, 40, 42, 44, 46, 48, 50, 52, 53, 39, 37, 35, 33, 31, 29, 27,
];

/// Digital output pins (P-pins), in restore/discovery order.
pub const P_PINS: [u16; 32] = [
    36, 34, 32, 30, 28, 26, 24, 22, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 45, 47, 14, 15, 16, 17,
    18, 19, 49, 51, 23, 25,
];

/// Analog channel count; channels are 0..16.
pub const A_CHAN_COUNT: usize = 16;

pub fn is_p_pin(pin: u16) -> bool {
    P_PINS.contains(&pin)
}

pub fn is_s_pin(pin: u16) -> bool {
    S_PINS.contains(&pin)
}
