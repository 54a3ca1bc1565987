use fwimg::config::Config;

pub const FLASH_BASE: u32 = 0x0800_0000;

/// Supported target families. Each one fixes the flash program unit and page size.
#[derive(clap::ArgEnum, Clone, Copy, Debug)]
pub enum Board {
    L4,
    G0,
    G4,
    L5,
    Wb55,
    H7,
}

#[derive(clap::ArgEnum, Clone, Copy, Debug)]
pub enum Profile {
    /// Decrypt in place inside the active slot
    Single,
    /// Stage in a download slot and swap
    Dual,
}

impl Board {
    /// Page size, slot size and swap region size in bytes.
    pub fn geometry(self) -> (u32, u32, u32) {
        match self {
            Board::L4 | Board::G4 => (2048, 0x1_0000, 0x2000),
            Board::G0 => (2048, 0xC000, 0x2000),
            Board::L5 | Board::Wb55 => (4096, 0x1_0000, 0x4000),
            Board::H7 => (0x2_0000, 0x6_0000, 0x2_0000),
        }
    }

    pub fn config(self, profile: Profile) -> Config {
        let (page, slot, swap) = self.geometry();
        match profile {
            Profile::Single => Config::single_slot(FLASH_BASE, page, slot),
            Profile::Dual => Config::dual_slot(FLASH_BASE, page, slot, swap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_valid() {
        for board in [Board::L4, Board::G0, Board::G4, Board::L5, Board::Wb55, Board::H7] {
            let write_unit = match board {
                Board::H7 => 32,
                _ => 8,
            };
            let (page, _, _) = board.geometry();
            for profile in [Profile::Single, Profile::Dual] {
                let config = board.config(profile);
                config
                    .validate(write_unit, page as usize, config.required_capacity())
                    .unwrap();
            }
        }
    }
}
