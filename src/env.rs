//! Environment-variable substitution for configuration values and
//! command environment declarations.
//!
//! Substitution expands `${NAME}` and `${NAME:-default}` markers. Names
//! are resolved against an override map first, then the process
//! environment. The substituted value is never rescanned, and an
//! unterminated `${` is copied through literally.

use std::collections::HashMap;

use tracing::warn;

/// Values already resolved for the command being assembled. A key mapped
/// to `None` is known-absent and suppresses the process-environment
/// fallback.
pub type Overrides = HashMap<String, Option<String>>;

// Bytes that may appear in a substitution name. ':' and '}' are included
// so the scanner reaches the default-value separator and the terminator.
const fn build_name_table() -> [bool; 256] {
    let mut table = [false; 256];
    let mut i = 0;

    while i < 256 {
        let byte = i as u8;
        table[i] = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'_' | b'(' | b')' | b'+' | b'-' | b'.' | b'/' | b'?' | b':' | b'}'
            );
        i += 1;
    }

    table
}

static NAME_CHARS: [bool; 256] = build_name_table();

/// Looks up `name` in the overrides, falling back to the process
/// environment when the overrides do not know the name at all.
pub fn lookup(name: &str, overrides: &Overrides) -> Option<String> {
    match overrides.get(name) {
        Some(value) => value.clone(),
        None => std::env::var(name).ok(),
    }
}

/// Substitutes environment variables into `input`, resolving each name
/// through `overrides` and then the process environment.
pub fn substitute(input: &str, overrides: &Overrides) -> String {
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(input.len());
    let mut copied = 0;
    let mut i = 0;

    while let Some(dollar) = input[i..].find("${").map(|offset| i + offset) {
        result.push_str(&input[copied..dollar]);
        copied = dollar;

        let name_start = dollar + 2;
        i = name_start;

        while i < bytes.len() && NAME_CHARS[bytes[i] as usize] {
            match bytes[i] {
                b':' => {
                    if bytes.get(i + 1) != Some(&b'-') {
                        break;
                    }

                    let default_start = i + 2;
                    let Some(end) = input[default_start..].find('}').map(|offset| default_start + offset)
                    else {
                        i = bytes.len();
                        break;
                    };

                    match lookup(&input[name_start..i], overrides) {
                        Some(value) => result.push_str(&value),
                        None => result.push_str(&input[default_start..end]),
                    }

                    copied = end + 1;
                    i = copied;
                    break;
                }
                b'}' => {
                    let name = &input[name_start..i];

                    match lookup(name, overrides) {
                        Some(value) => result.push_str(&value),
                        None => {
                            warn!("environment variable {name:?} is not defined, substituting an empty string");
                        }
                    }

                    copied = i + 1;
                    i = copied;
                    break;
                }
                _ => i += 1,
            }
        }
    }

    result.push_str(&input[copied..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, Option<&str>)]) -> Overrides {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
            .collect()
    }

    #[test]
    fn input_without_markers_is_unchanged() {
        assert_eq!(substitute("plain text, no markers", &Overrides::new()), "plain text, no markers");
        assert_eq!(substitute("", &Overrides::new()), "");
        assert_eq!(substitute("$NOT_A_MARKER", &Overrides::new()), "$NOT_A_MARKER");
    }

    #[test]
    fn substitutes_from_overrides() {
        let map = overrides(&[("GREETING", Some("hello"))]);
        assert_eq!(substitute("${GREETING}, world", &map), "hello, world");
        assert_eq!(substitute("${GREETING}${GREETING}", &map), "hellohello");
    }

    #[test]
    fn substitutes_from_process_environment() {
        std::env::set_var("K8PSH_ENV_TEST_PRESENT", "yes");
        assert_eq!(substitute("${K8PSH_ENV_TEST_PRESENT}", &Overrides::new()), "yes");
    }

    #[test]
    fn known_absent_override_suppresses_environment_fallback() {
        std::env::set_var("K8PSH_ENV_TEST_SHADOWED", "visible");
        let map = overrides(&[("K8PSH_ENV_TEST_SHADOWED", None)]);
        assert_eq!(substitute("<${K8PSH_ENV_TEST_SHADOWED}>", &map), "<>");
    }

    #[test]
    fn default_value_used_only_when_missing() {
        let map = overrides(&[("SET", Some("value"))]);
        assert_eq!(substitute("${SET:-default}", &map), "value");
        assert_eq!(substitute("${K8PSH_ENV_TEST_MISSING:-default}", &map), "default");
        assert_eq!(substitute("${K8PSH_ENV_TEST_MISSING:-}", &map), "");
    }

    #[test]
    fn missing_without_default_substitutes_empty() {
        assert_eq!(substitute("a${K8PSH_ENV_TEST_MISSING}b", &Overrides::new()), "ab");
        assert_eq!(substitute("${}", &Overrides::new()), "");
    }

    #[test]
    fn unterminated_markers_are_copied_literally() {
        assert_eq!(substitute("${UNTERMINATED", &Overrides::new()), "${UNTERMINATED");
        assert_eq!(substitute("a${UNTERMINATED:-x", &Overrides::new()), "a${UNTERMINATED:-x");
        assert_eq!(substitute("${A:x}", &Overrides::new()), "${A:x}");
    }

    #[test]
    fn invalid_name_bytes_end_the_marker() {
        // A space is not a name byte, so the whole marker is left alone.
        assert_eq!(substitute("${A B}", &Overrides::new()), "${A B}");

        let map = overrides(&[("B", Some("yes"))]);
        assert_eq!(substitute("${A B} ${B}", &map), "${A B} yes");
    }

    #[test]
    fn substitution_is_not_recursive() {
        let map = overrides(&[("OUTER", Some("${INNER}")), ("INNER", Some("no"))]);
        assert_eq!(substitute("${OUTER}", &map), "${INNER}");
    }
}
