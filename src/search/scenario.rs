use std::{fmt, fs, path::Path};

use super::error::{ConfigError, Error, Result};

/// Longest horizon a run can enumerate.
pub const MAX_HORIZON: u32 = 30;

/// One availability pattern. Slot `j` is covered by the external resource
/// when bit `horizon - 1 - j` of `id` is set, so the binary text of `id` reads
/// left to right in slot order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scenario {
    pub id: u64,
    pub horizon: u8,
}

/// Coarse shape of a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScenarioClass {
    /// No slot is covered externally.
    Critical,
    /// Every slot is covered externally.
    Optimal,
    Mixed,
}

impl Scenario {
    pub fn new(id: u64, horizon: u8) -> Self {
        Self { id, horizon }
    }

    /// Scenario whose coverage matches `flags`, slot 0 first.
    pub fn from_flags(flags: &[bool]) -> Self {
        let id = flags
            .iter()
            .fold(0u64, |id, covered| (id << 1) | u64::from(*covered));
        Self {
            id,
            horizon: flags.len() as u8,
        }
    }

    pub fn covered(&self, slot: usize) -> bool {
        let shift = self.horizon as usize - 1 - slot;
        (self.id >> shift) & 1 == 1
    }

    pub fn flags(&self) -> Vec<bool> {
        let mut flags = Vec::with_capacity(self.horizon as usize);
        self.fill_flags(&mut flags);
        flags
    }

    /// Writes the coverage flags into `out`, reusing its allocation.
    pub fn fill_flags(&self, out: &mut Vec<bool>) {
        out.clear();
        out.extend((0..self.horizon as usize).map(|slot| self.covered(slot)));
    }

    pub fn pattern_bits(&self) -> String {
        format!("{:0width$b}", self.id, width = self.horizon as usize)
    }

    /// Slots that must be served by the machine itself.
    pub fn deficit_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.horizon as usize).filter(|slot| !self.covered(*slot))
    }

    pub fn class(&self) -> ScenarioClass {
        let full = if self.horizon >= 64 {
            u64::MAX
        } else {
            (1u64 << self.horizon) - 1
        };
        match self.id & full {
            0 => ScenarioClass::Critical,
            id if id == full => ScenarioClass::Optimal,
            _ => ScenarioClass::Mixed,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}]", self.id, self.pattern_bits())
    }
}

/// Number of distinct patterns over `horizon` slots.
pub fn total_scenarios(horizon: u32) -> Result<u64, ConfigError> {
    if horizon == 0 || horizon > MAX_HORIZON {
        Err(ConfigError::Horizon {
            got: horizon,
            max: MAX_HORIZON,
        })?
    }
    Ok(1u64 << horizon)
}

/// Reads coverage flags from the first line of `text` that is not blank or a
/// `#` comment. Flags are whitespace separated `0` or `1` tokens.
pub fn parse_flags(text: &str) -> Result<Vec<bool>> {
    let line = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .find(|line| !line.is_empty())
        .ok_or_else(|| Error::Input("no availability line found".into()))?;

    let flags = line
        .split_whitespace()
        .map(|token| match token {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(Error::Input(format!("expected 0 or 1, found {other:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    if flags.len() > MAX_HORIZON as usize {
        Err(ConfigError::Horizon {
            got: flags.len() as u32,
            max: MAX_HORIZON,
        })?
    }
    Ok(flags)
}

/// Loads a scenario file.
pub fn load(path: impl AsRef<Path>) -> Result<Scenario> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io("read", path, e))?;
    Ok(Scenario::from_flags(&parse_flags(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_read_in_slot_order() {
        let scenario = Scenario::new(0b1011, 4);
        assert_eq!(scenario.pattern_bits(), "1011");
        assert_eq!(scenario.flags(), vec![true, false, true, true]);
        assert_eq!(scenario.deficit_slots().collect::<Vec<_>>(), vec![1]);
        assert_eq!(Scenario::from_flags(&scenario.flags()), scenario);

        assert_eq!(Scenario::new(3, 6).pattern_bits(), "000011");
    }

    #[test]
    fn classes() {
        assert_eq!(Scenario::new(0, 5).class(), ScenarioClass::Critical);
        assert_eq!(Scenario::new(31, 5).class(), ScenarioClass::Optimal);
        assert_eq!(Scenario::new(7, 5).class(), ScenarioClass::Mixed);
    }

    #[test]
    fn horizon_bounds() {
        assert_eq!(total_scenarios(4), Ok(16));
        assert_eq!(total_scenarios(30), Ok(1 << 30));
        assert!(total_scenarios(0).is_err());
        assert!(total_scenarios(31).is_err());
    }

    #[test]
    fn parses_first_data_line() {
        let text = "# availability per hour\n\n1 0 0 1  # trailing\n0 0\n";
        assert_eq!(
            parse_flags(text).unwrap(),
            vec![true, false, false, true]
        );
        assert!(matches!(parse_flags("# nothing\n"), Err(Error::Input(_))));
        assert!(matches!(parse_flags("1 2 0"), Err(Error::Input(_))));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.txt");
        fs::write(&path, "0 1 1\n").unwrap();
        assert_eq!(load(&path).unwrap(), Scenario::new(0b011, 3));
        assert!(matches!(
            load(dir.path().join("missing.txt")),
            Err(Error::Io { .. })
        ));
    }
}
