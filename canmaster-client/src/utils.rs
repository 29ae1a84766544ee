//! Small helpers shared across the crate

/// Normalize an entry name for dictionary lookup
///
/// Lowercases and collapses every run of non-alphanumeric characters into a
/// single underscore, so callers may pass any case/punctuation variant of a
/// name ("Velocity Actual Value" == "velocity_actual_value").
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Format an address for error messages, matching dictionary error texts
pub fn address_string(index: u16, subindex: u8) -> String {
    format!("{index}sub{subindex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_normalizes_case_and_punctuation() {
        assert_eq!("velocity_actual_value", escape("Velocity Actual Value"));
        assert_eq!("pre_defined_error_field", escape("Pre-defined error field"));
        assert_eq!("statusword", escape("Statusword"));
        assert_eq!("device_type", escape("Device  -  Type"));
    }

    #[test]
    fn escape_is_idempotent() {
        assert_eq!(
            escape("velocity_actual_value"),
            escape(&escape("Velocity Actual Value"))
        );
    }
}
