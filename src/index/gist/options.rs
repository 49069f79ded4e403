//! Index reloptions: `fillfactor` and `buffering`.

use std::str::FromStr;

use derive_with::With;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::{GistError, GistResult};
use crate::storage::page::BLCKSZ;

pub const GIST_MIN_FILLFACTOR: u32 = 10;
pub const GIST_MAX_FILLFACTOR: u32 = 100;
pub const GIST_DEFAULT_FILLFACTOR: u32 = 90;

/// When a bulk build switches to buffered mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BufferingMode {
    /// After gathering tuple size statistics.
    On,
    Off,
    /// Once the index outgrows the effective cache.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, With)]
pub struct GistOptions {
    pub fillfactor: u32,
    pub buffering: BufferingMode,
}

impl Default for GistOptions {
    fn default() -> Self {
        GistOptions {
            fillfactor: GIST_DEFAULT_FILLFACTOR,
            buffering: BufferingMode::Auto,
        }
    }
}

impl GistOptions {
    /// Parses `name=value` strings, as stored in a reloptions array.
    pub fn parse<'a>(options: impl IntoIterator<Item = &'a str>) -> GistResult<Self> {
        let mut pairs = Vec::new();
        for option in options {
            let (name, value) = option.split_once('=').ok_or_else(|| GistError::InvalidOption {
                message: format!("invalid option syntax \"{}\"", option),
                detail: "Options must be given as name=value.".to_string(),
            })?;
            pairs.push((name.trim(), value.trim()));
        }
        Self::from_pairs(&pairs)
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> GistResult<Self> {
        let mut options = GistOptions::default();
        let mut seen_fillfactor = false;
        let mut seen_buffering = false;

        for (name, value) in pairs {
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "fillfactor" => {
                    check_duplicate(&name, &mut seen_fillfactor)?;
                    options.fillfactor = parse_fillfactor(value)?;
                }
                "buffering" => {
                    check_duplicate(&name, &mut seen_buffering)?;
                    options.buffering = BufferingMode::from_str(value).map_err(|_| {
                        GistError::InvalidOption {
                            message: format!("invalid value for enum option \"buffering\": {}", value),
                            detail: valid_buffering_values(),
                        }
                    })?;
                }
                _ => {
                    return Err(GistError::InvalidOption {
                        message: format!("unrecognized parameter \"{}\"", name),
                        detail: String::new(),
                    })
                }
            }
        }
        Ok(options)
    }

    /// Bytes each page keeps free while the index is built.
    pub fn freespace(&self) -> usize {
        BLCKSZ * (100 - self.fillfactor as usize) / 100
    }

    /// The options back in `name=value` form.
    pub fn to_strings(&self) -> Vec<String> {
        vec![
            format!("fillfactor={}", self.fillfactor),
            format!("buffering={}", self.buffering),
        ]
    }
}

fn check_duplicate(name: &str, seen: &mut bool) -> GistResult<()> {
    if *seen {
        return Err(GistError::InvalidOption {
            message: format!("parameter \"{}\" specified more than once", name),
            detail: String::new(),
        });
    }
    *seen = true;
    Ok(())
}

fn parse_fillfactor(value: &str) -> GistResult<u32> {
    let parsed: i64 = value.parse().map_err(|_| GistError::InvalidOption {
        message: format!("invalid value for integer option \"fillfactor\": {}", value),
        detail: String::new(),
    })?;
    if parsed < GIST_MIN_FILLFACTOR as i64 || parsed > GIST_MAX_FILLFACTOR as i64 {
        return Err(GistError::InvalidOption {
            message: format!("value {} out of bounds for option \"fillfactor\"", value),
            detail: format!(
                "Valid values are between \"{}\" and \"{}\".",
                GIST_MIN_FILLFACTOR, GIST_MAX_FILLFACTOR
            ),
        });
    }
    Ok(parsed as u32)
}

fn valid_buffering_values() -> String {
    let names: Vec<String> = BufferingMode::iter().map(|m| format!("\"{}\"", m)).collect();
    let mut detail = String::from("Valid values are ");
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            detail.push_str(if i + 1 == names.len() { ", and " } else { ", " });
        }
        detail.push_str(name);
    }
    detail.push('.');
    detail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_freespace() {
        let options = GistOptions::parse(std::iter::empty()).unwrap();
        assert_eq!(options, GistOptions::default());
        assert_eq!(options.fillfactor, 90);
        assert_eq!(options.buffering, BufferingMode::Auto);
        assert_eq!(options.freespace(), BLCKSZ * 10 / 100);
        assert_eq!(GistOptions::default().with_fillfactor(100u32).freespace(), 0);
    }

    #[test]
    fn fillfactor_bounds() {
        let err = GistOptions::parse(["fillfactor=5"]).unwrap_err();
        assert_eq!(err.to_string(), "value 5 out of bounds for option \"fillfactor\"");
        assert_eq!(err.detail(), Some("Valid values are between \"10\" and \"100\"."));

        assert_eq!(GistOptions::parse(["fillfactor=100"]).unwrap().fillfactor, 100);
        assert_eq!(GistOptions::parse(["fillfactor=10"]).unwrap().fillfactor, 10);
        assert!(GistOptions::parse(["fillfactor=101"]).is_err());
        assert!(GistOptions::parse(["fillfactor=ninety"]).is_err());
    }

    #[test]
    fn buffering_values() {
        let err = GistOptions::parse(["buffering=BOGUS"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for enum option \"buffering\": BOGUS");
        assert_eq!(err.detail(), Some("Valid values are \"on\", \"off\", and \"auto\"."));

        let options = GistOptions::parse(["buffering=ON", "fillfactor=70"]).unwrap();
        assert_eq!(options.buffering, BufferingMode::On);
        assert_eq!(options.fillfactor, 70);
        assert_eq!(
            GistOptions::from_pairs(&[("buffering", "off")]).unwrap().buffering,
            BufferingMode::Off
        );
    }

    #[test]
    fn unknown_duplicate_and_malformed() {
        assert!(matches!(
            GistOptions::parse(["pages_per_range=4"]),
            Err(GistError::InvalidOption { .. })
        ));
        assert!(GistOptions::parse(["fillfactor=50", "FILLFACTOR=60"]).is_err());
        assert!(GistOptions::parse(["fillfactor"]).is_err());
    }

    #[test]
    fn round_trips_through_strings() {
        let options = GistOptions::default()
            .with_fillfactor(42u32)
            .with_buffering(BufferingMode::Off);
        let strings = options.to_strings();
        let parsed = GistOptions::parse(strings.iter().map(String::as_str)).unwrap();
        assert_eq!(parsed, options);
    }
}
