use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Used when neither `RUST_LOG` nor `SOURCEGATE_LOG` is set. HTTP client
/// internals stay quiet so reachability checks do not flood stderr.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

pub fn init() -> anyhow::Result<()> {
    let filter = filter_from(
        std::env::var("RUST_LOG").ok(),
        std::env::var("SOURCEGATE_LOG").ok(),
    )?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

/// `RUST_LOG` wins over `SOURCEGATE_LOG`; blank values are skipped.
fn filter_from(rust_log: Option<String>, own: Option<String>) -> anyhow::Result<EnvFilter> {
    let (source, directives) = [("RUST_LOG", rust_log), ("SOURCEGATE_LOG", own)]
        .into_iter()
        .find_map(|(name, value)| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| (name, v))
        })
        .unwrap_or_else(|| ("default", DEFAULT_DIRECTIVES.to_owned()));
    EnvFilter::try_new(&directives)
        .with_context(|| format!("build log filter from {source}={directives:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_takes_precedence() -> anyhow::Result<()> {
        let filter = filter_from(Some("debug".to_owned()), Some("warn".to_owned()))?;
        assert_eq!(filter.to_string(), "debug");
        Ok(())
    }

    #[test]
    fn falls_back_to_sourcegate_log_then_default() -> anyhow::Result<()> {
        let filter = filter_from(Some("  ".to_owned()), Some("sourcegate=trace".to_owned()))?;
        assert_eq!(filter.to_string(), "sourcegate=trace");

        let filter = filter_from(None, None)?;
        assert!(filter.to_string().contains("reqwest=warn"));
        Ok(())
    }

    #[test]
    fn invalid_directives_name_their_source() {
        let err = filter_from(None, Some("sourcegate=loud".to_owned())).unwrap_err();
        assert!(format!("{err:#}").contains("SOURCEGATE_LOG"), "{err:#}");
    }
}
