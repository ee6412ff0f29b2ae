//! `RUST_LOG`-style level filtering for `slog` drains.

use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

/// Environment variable holding the filter directives.
pub const FILTER_ENV: &str = "RUST_LOG";

#[derive(Debug, PartialEq)]
struct Filter {
    module: Option<String>,
    level: Level,
}

impl Filter {
    #[inline]
    fn match_module(&self, module: &str) -> Option<&Self> {
        match &self.module {
            Some(prefix) => module.starts_with(prefix.as_str()).then(|| self),
            None => Some(self),
        }
    }

    #[inline]
    fn match_level(&self, level: Level) -> bool {
        level.is_at_least(self.level)
    }
}

/// `slog` only knows `warn` and the short names, accept `warning` too.
fn parse_level(level: &str) -> Option<Level> {
    if level.eq_ignore_ascii_case("warning") {
        return Some(Level::Warning);
    }
    Level::from_str(level).ok()
}

#[derive(Debug)]
struct Directives(Vec<Filter>);

impl Directives {
    #[inline]
    fn is_enabled(&self, module: &str, level: Level) -> bool {
        // Find the last-match filter and check the allowed level
        self.0
            .iter()
            .filter_map(|filter| filter.match_module(module))
            .last()
            .map(|filter| filter.match_level(level))
            .unwrap_or_default()
    }
}

/// Parse filter to be a list of valid prefix strings.
///
/// `module=level` or `level` where the module is a valid module
/// prefix and the level a supported level name (`critical`, `error`,
/// `warning`, `info`, `debug`, `trace`).
///
/// Invalid directives are ignored.
impl From<&str> for Directives {
    fn from(filter: &str) -> Self {
        let filters = filter
            .split(',')
            .map(str::trim)
            .filter_map(|directive| match directive.split_once('=') {
                None => parse_level(directive).map(|level| Filter {
                    module: None,
                    level,
                }),
                Some((module, level)) => {
                    let valid = !module.is_empty()
                        && module
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-'));
                    if !valid {
                        return None;
                    }
                    parse_level(level).map(|level| Filter {
                        module: Some(module.replace('-', "_")),
                        level,
                    })
                }
            })
            .collect();

        Self(filters)
    }
}

/// Drain wrapper that drops records not enabled by the directives.
pub struct Logger<T: Drain> {
    drain: T,
    directives: Directives,
}

impl<T: Drain> Logger<T> {
    /// Use the directives from `RUST_LOG` or `filter` if it is unset.
    pub fn with_default_filter(drain: T, filter: &str) -> Self {
        let filter = env::var(FILTER_ENV).unwrap_or_else(|_| filter.to_string());

        Self {
            drain,
            directives: filter.as_str().into(),
        }
    }
}

impl<T> Drain for Logger<T>
where
    T: Drain<Ok = ()>,
{
    type Err = T::Err;
    type Ok = ();

    fn log(&self, info: &Record<'_>, val: &OwnedKVList) -> Result<(), T::Err> {
        if !self.directives.is_enabled(info.module(), info.level()) {
            return Ok(());
        }

        self.drain.log(info, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_last_match_wins() {
        let directives = Directives::from("info,wdog::supervisor=debug");
        assert!(directives.is_enabled("wdog::supervisor", Level::Debug));
        assert!(!directives.is_enabled("wdog::channel", Level::Debug));
        assert!(directives.is_enabled("wdog::channel", Level::Warning));
    }

    #[test]
    fn test_invalid_directives_are_ignored() {
        let directives = Directives::from("bogus,wd og=debug,=info,error");
        assert_eq!(directives.0.len(), 1);
        assert!(directives.is_enabled("anything", Level::Critical));
        assert!(!directives.is_enabled("anything", Level::Info));
    }

    #[test]
    fn test_level_names() {
        for (name, level) in [
            ("critical", Level::Critical),
            ("error", Level::Error),
            ("warning", Level::Warning),
            ("WARNING", Level::Warning),
            ("warn", Level::Warning),
            ("info", Level::Info),
            ("debug", Level::Debug),
            ("trace", Level::Trace),
        ] {
            assert_eq!(parse_level(name), Some(level), "{}", name);
        }

        let directives = Directives::from("wdog=warning");
        assert_eq!(directives.0.len(), 1);
        assert!(directives.is_enabled("wdog::relay", Level::Warning));
        assert!(!directives.is_enabled("wdog::relay", Level::Info));
    }

    #[test]
    fn test_empty_filter_disables_everything() {
        let directives = Directives::from("");
        assert!(!directives.is_enabled("wdog", Level::Critical));
    }
}
