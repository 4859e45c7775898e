//! Filesystem locations.
//!
//! Telemetry and diagnostics files live under the user's data directory,
//! `$XDG_DATA_HOME/llm-observe` or `~/.local/share/llm-observe`.

use std::env;
use std::path::PathBuf;

/// Directory name under the data home.
const APP_DIR: &str = "llm-observe";

/// Returns the data directory used for local telemetry files.
///
/// Falls back to `./.llm-observe` when no home directory can be determined.
///
/// # Examples
///
/// ```no_run
/// use llm_observe::infrastructure::data_dir;
///
/// let file = data_dir().join("telemetry-otlp.json");
/// ```
#[must_use]
pub fn data_dir() -> PathBuf {
    resolve_data_dir(
        env::var_os("XDG_DATA_HOME").map(PathBuf::from),
        env::var_os("HOME").map(PathBuf::from),
    )
}

fn resolve_data_dir(xdg_data_home: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(xdg) = xdg_data_home.filter(|p| p.is_absolute()) {
        return xdg.join(APP_DIR);
    }
    home.map_or_else(
        || PathBuf::from(".").join(format!(".{APP_DIR}")),
        |home| home.join(".local").join("share").join(APP_DIR),
    )
}

/// Expands a leading `~` to the user's home directory.
///
/// Paths without a leading `~`, or with no known home, are returned as is.
///
/// # Examples
///
/// ```no_run
/// use llm_observe::infrastructure::expand_tilde;
///
/// let path = expand_tilde("~/traces/otlp.json");
/// assert!(!path.starts_with("~"));
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    expand_with_home(path, env::var_os("HOME").map(PathBuf::from))
}

fn expand_with_home(path: &str, home: Option<PathBuf>) -> PathBuf {
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdg_data_home_wins_when_absolute() {
        let dir = resolve_data_dir(Some(PathBuf::from("/xdg")), Some(PathBuf::from("/home/u")));
        assert_eq!(dir, PathBuf::from("/xdg/llm-observe"));

        let dir = resolve_data_dir(Some(PathBuf::from("relative")), Some(PathBuf::from("/home/u")));
        assert_eq!(dir, PathBuf::from("/home/u/.local/share/llm-observe"));
    }

    #[test]
    fn tilde_expansion() {
        let home = Some(PathBuf::from("/home/u"));
        assert_eq!(expand_with_home("~/a/b", home.clone()), PathBuf::from("/home/u/a/b"));
        assert_eq!(expand_with_home("~", home.clone()), PathBuf::from("/home/u"));
        assert_eq!(expand_with_home("/abs", home), PathBuf::from("/abs"));
        assert_eq!(expand_with_home("~/a", None), PathBuf::from("~/a"));
    }
}
