//! Environment overrides for capture behavior. Each flag is read once per
//! process.

/// Returns `true` when the environment variable is set to a truthy value
/// (`1`, `true`, `yes`, or `on`, case-insensitive, trimmed).
#[inline]
pub(crate) fn env_var_truthy(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|raw| parse_truthy(&raw))
        .unwrap_or(false)
}

fn parse_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

/// Declares a cached boolean flag backed by a `OnceLock<bool>`.
///
/// `enabled_unless(fn_name, "ENV_VAR")` returns `true` unless the env var
/// is truthy.
///
/// `enabled_when(fn_name, "ENV_VAR")` returns `true` only when the env var
/// is truthy.
macro_rules! define_env_flag {
    (enabled_unless($fn_name:ident, $var:expr)) => {
        #[inline]
        pub(crate) fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| !$crate::env_config::env_var_truthy($var))
        }
    };
    (enabled_when($fn_name:ident, $var:expr)) => {
        #[inline]
        pub(crate) fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| $crate::env_config::env_var_truthy($var))
        }
    };
}

define_env_flag!(enabled_unless(
    gpu_tonemap_allowed,
    "TONEMAP_CAPTURE_DISABLE_GPU_TONEMAP"
));
define_env_flag!(enabled_when(force_sdr, "TONEMAP_CAPTURE_FORCE_SDR"));

#[cfg(test)]
mod tests {
    use super::parse_truthy;

    #[test]
    fn truthy_values_are_case_insensitive_and_trimmed() {
        for raw in ["1", "true", " TRUE ", "Yes", "on"] {
            assert!(parse_truthy(raw), "{raw:?} should be truthy");
        }
        for raw in ["0", "false", "off", "", "2"] {
            assert!(!parse_truthy(raw), "{raw:?} should be falsey");
        }
    }
}
