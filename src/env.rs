//! Environment composition for child processes.
//!
//! The child environment is the inherited environment filtered through
//! blacklist/whitelist needles, with explicit pairs appended last so
//! they win over anything inherited.

/// Does `needle` match the environment entry `entry` (`"KEY=VAL"`)?
///
/// Needle forms, in order:
/// - trailing `*`: prefix match against the whole entry (so `FOO*`
///   covers `FOO=..` and `FOOBAR=..`, and `*` alone covers everything)
/// - no `=`: exact-key match (`FOO` covers `FOO=..` but not `FOOBAR=..`)
/// - otherwise: raw prefix match, key and value included
fn matches(needle: &str, entry: &str) -> bool {
    if let Some(prefix) = needle.strip_suffix('*') {
        return entry.starts_with(prefix);
    }
    if !needle.contains('=') {
        return entry.len() > needle.len()
            && entry.as_bytes()[needle.len()] == b'='
            && entry.starts_with(needle);
    }
    entry.starts_with(needle)
}

/// Compose the environment handed to a child process.
///
/// An inherited entry survives unless a blacklist needle matches it; a
/// non-empty whitelist overrides the blacklist for entries it matches.
/// Explicit pairs are never filtered and appear last.
pub(crate) fn compose<I>(
    inherited: I,
    blacklist: &[String],
    whitelist: &[String],
    explicit: &[(String, String)],
) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut environ: Vec<String> = inherited
        .into_iter()
        .filter(|entry| {
            let denied = blacklist.iter().any(|needle| matches(needle, entry));
            let allowed =
                !whitelist.is_empty() && whitelist.iter().any(|needle| matches(needle, entry));
            !denied || allowed
        })
        .collect();

    for (key, value) in explicit {
        environ.push(format!("{key}={value}"));
    }
    environ
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<String> {
        vec!["FOO=BAR".to_string(), "FOOBAR=BARBAR".to_string()]
    }

    fn filter(blacklist: &[&str], whitelist: &[&str]) -> Vec<String> {
        let blacklist: Vec<String> = blacklist.iter().map(ToString::to_string).collect();
        let whitelist: Vec<String> = whitelist.iter().map(ToString::to_string).collect();
        compose(base(), &blacklist, &whitelist, &[])
    }

    #[test]
    fn exact_key_blacklist_keeps_longer_keys() {
        assert_eq!(filter(&["FOO"], &[]), vec!["FOOBAR=BARBAR"]);
    }

    #[test]
    fn star_suffix_blacklist_strips_prefixed_keys() {
        assert!(filter(&["FOO*"], &[]).is_empty());
    }

    #[test]
    fn star_blacklist_strips_everything() {
        assert!(filter(&["*"], &[]).is_empty());
    }

    #[test]
    fn whitelist_overrides_blacklist() {
        assert_eq!(filter(&["*"], &["FOO"]), vec!["FOO=BAR"]);
        assert_eq!(filter(&["*", "FOO*"], &["*"]), base());
    }

    #[test]
    fn key_value_needle_matches_prefix() {
        assert_eq!(filter(&["FOO=B"], &[]), vec!["FOOBAR=BARBAR"]);
    }

    #[test]
    fn empty_lists_keep_everything() {
        assert_eq!(filter(&[], &[]), base());
    }

    #[test]
    fn explicit_pairs_bypass_filters_and_come_last() {
        let explicit = vec![("FOO".to_string(), "OVERRIDE".to_string())];
        let environ = compose(base(), &["*".to_string()], &[], &explicit);
        assert_eq!(environ, vec!["FOO=OVERRIDE"]);
    }
}
