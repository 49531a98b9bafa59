use crate::optimize::{DiagnosticLevel, OptimizeOptions};

/// Interpret a string value such as "1" or "no" as a boolean.
pub fn str_as_bool(s: &str) -> bool {
    match s {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => {
            eprintln!("Unrecognized boolean value \"{}\"", s);
            false
        }
    }
}

/// Parse optimization flags from the `RTEN_FOLD` environment variable and
/// update the options `opts`.
///
/// This env var is a space-separated sequence of `key=value` pairs. The
/// supported keys are `diagnostics` (`off`, `warn` or `info`),
/// `max-rewrites` and `propagate-constants`.
pub fn parse_fold_config(config: &str, opts: &mut OptimizeOptions) {
    for token in config.split_ascii_whitespace() {
        if let Some((key, val)) = token.split_once('=') {
            let (key, val) = (key.trim(), val.trim());

            match key {
                "diagnostics" => match DiagnosticLevel::from_name(val) {
                    Some(level) => opts.diagnostics = level,
                    None => eprintln!("Unrecognized diagnostic level \"{}\"", val),
                },
                "max-rewrites" => match val.parse() {
                    Ok(limit) => opts.max_rewrites = limit,
                    Err(_) => eprintln!("Invalid rewrite limit \"{}\"", val),
                },
                "propagate-constants" => opts.propagate_constants = str_as_bool(val),
                _ => {
                    eprintln!("Unrecognized optimization option \"{}\"", key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_fold_config, str_as_bool};
    use crate::optimize::{DiagnosticLevel, OptimizeOptions};

    #[test]
    fn test_str_as_bool() {
        assert!(str_as_bool("yes"));
        assert!(str_as_bool("1"));
        assert!(!str_as_bool("f"));
        assert!(!str_as_bool("maybe"));
    }

    #[test]
    fn test_parse_fold_config() {
        let mut opts = OptimizeOptions::default();
        parse_fold_config(
            "diagnostics=warn  max-rewrites=50 propagate-constants=no",
            &mut opts,
        );
        assert_eq!(
            opts,
            OptimizeOptions {
                diagnostics: DiagnosticLevel::Warn,
                max_rewrites: 50,
                propagate_constants: false,
            }
        );

        // Invalid values and unknown keys leave options unchanged.
        let mut opts = OptimizeOptions::default();
        parse_fold_config(
            "diagnostics=loud max-rewrites=-1 colors=on verbose",
            &mut opts,
        );
        assert_eq!(opts, OptimizeOptions::default());
    }
}
