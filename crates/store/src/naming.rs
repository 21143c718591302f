use rand::Rng;

use super::Error;

/// Separator between a sharded vertex's base name and its shard index.
pub const SHARD_SEPARATOR: char = '$';

/// Validate a vertex-definition name.
///
/// The artifact store requires DNS-style names:
/// `^([a-z0-9]([-a-z0-9]){2,62}|\$root)$` — 3 to 63 characters, lowercase
/// alphanumerics and dashes, starting with an alphanumeric and not ending
/// with a dash; the literal `$root` is also accepted.
///
/// # Test
///
/// ```
/// use cra_store::naming::validate_definition_name;
///
/// assert!(validate_definition_name("ab-cd").is_ok());
/// assert!(validate_definition_name("$root").is_ok());
/// assert!(validate_definition_name("ab").is_err());
/// assert!(validate_definition_name("-abc").is_err());
/// ```
pub fn validate_definition_name(name: &str) -> Result<(), Error> {
    if name == "$root" {
        return Ok(());
    }

    let bytes = name.as_bytes();
    let valid = (3..=63).contains(&bytes.len())
        && (bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit())
        && bytes[bytes.len() - 1] != b'-'
        && bytes[1..]
            .iter()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || *byte == b'-');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Validate a vertex, endpoint, or instance identifier: non-empty and free
/// of the `:` used in composite row keys.
pub fn validate_identifier(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.contains(':') {
        return Err(Error::InvalidName(name.to_string()));
    }

    Ok(())
}

/// The cluster-wide name of one shard of a sharded vertex.
pub fn shard_name(base: &str, index: u32) -> String {
    format!("{}{}{}", base, SHARD_SEPARATOR, index)
}

/// Split `base$N` back into its parts; `None` for non-sharded names.
pub fn split_shard_name(name: &str) -> Option<(&str, u32)> {
    let (base, index) = name.rsplit_once(SHARD_SEPARATOR)?;
    if base.is_empty() {
        return None;
    }

    Some((base, index.parse().ok()?))
}

/// A fresh ephemeral instance name: 16 random lowercase ASCII letters.
pub fn ephemeral_instance_name() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| rng.random_range(b'a'..=b'z') as char)
        .collect()
}
