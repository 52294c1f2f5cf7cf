//! Command-line flags.  Every flag overrides the matching config entry.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug, Default)]
#[command(
    name = "portmerge",
    version,
    about = "Merge records from several ports into one, driven by a format"
)]
pub struct Args {
    /// Format in text form, e.g. "(/imu:o[1-3] (/gps:o))"
    #[clap(short, long)]
    pub format: Option<String>,
    /// Merge frequency in Hz
    #[clap(long)]
    pub frequency: Option<f64>,
    /// Prefix of the ports opened by the merger
    #[clap(short, long)]
    pub port: Option<String>,
    /// Transport name: local or udp
    #[clap(short, long)]
    pub transport: Option<String>,
    /// Configuration file; defaults to ./portmerge.toml when present
    #[clap(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Overwrite every entry of `cfg` that was given on the command line.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(format) = &self.format {
            cfg.format = Some(format.clone());
        }
        if let Some(hz) = self.frequency {
            cfg.frequency = hz;
        }
        if let Some(port) = &self.port {
            cfg.port = port.clone();
        }
        if let Some(transport) = &self.transport {
            cfg.transport = transport.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "portmerge",
            "--format",
            "(/a:o[1])",
            "--frequency",
            "30",
            "-p",
            "/m",
            "--transport",
            "local",
            "--config",
            "merge.toml",
        ])
        .expect("valid flags");
        assert_eq!(args.format.as_deref(), Some("(/a:o[1])"));
        assert_eq!(args.frequency, Some(30.0));
        assert_eq!(args.port.as_deref(), Some("/m"));
        assert_eq!(args.transport.as_deref(), Some("local"));
        assert_eq!(args.config, Some(PathBuf::from("merge.toml")));
    }

    #[test]
    fn non_numeric_frequency_is_rejected() {
        assert!(Args::try_parse_from(["portmerge", "--frequency", "fast"]).is_err());
    }

    #[test]
    fn flags_win_over_config() {
        let mut cfg = Config {
            format: Some("(/file:o)".to_string()),
            transport: "udp".to_string(),
            ..Config::default()
        };
        let args = Args {
            format: Some("(/flag:o)".to_string()),
            frequency: Some(1.0),
            ..Args::default()
        };
        args.apply(&mut cfg);
        assert_eq!(cfg.format.as_deref(), Some("(/flag:o)"));
        assert_eq!(cfg.frequency, 1.0);
        assert_eq!(cfg.transport, "udp", "untouched without a flag");
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
