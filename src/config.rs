/// ACMD41 polls before a card is considered unusable
pub const OP_COND_ATTEMPTS: u32 = 1000;

/// Engine options, independent of the transport
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Config {
    /// Bound of the power up loop during reset
    pub op_cond_attempts: u32,
    /// Switch to a 4-bit data bus when both card and transport support it
    pub wide_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { op_cond_attempts: OP_COND_ATTEMPTS, wide_bus: true }
    }
}

impl Config {
    pub fn op_cond_attempts(mut self, attempts: u32) -> Self {
        self.op_cond_attempts = attempts;
        self
    }

    pub fn wide_bus(mut self, wide_bus: bool) -> Self {
        self.wide_bus = wide_bus;
        self
    }
}
