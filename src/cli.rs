use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::Settings;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "imageserver")]
#[command(about = "Receive images from a camera controller and write them to disk", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Listening port [default: 6543]
    #[arg(short, long, env = "IMAGESERVER_PORT")]
    pub port: Option<u16>,

    /// Ring the terminal bell when an image arrives
    #[arg(short, long)]
    pub beep: bool,

    /// Guide mode: line-terminated size header, fixed filename, no replies
    #[arg(short, long = "guide", visible_alias = "gcslbt")]
    pub guide: bool,

    /// Print every received filename and enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory that relative filenames are written under [default: .]
    #[arg(long, env = "IMAGESERVER_ROOT")]
    pub root: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0]
    #[arg(long, env = "IMAGESERVER_BIND")]
    pub bind: Option<IpAddr>,

    /// TOML settings file; command line flags take precedence
    #[arg(long, env = "IMAGESERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Never launch the image viewer, even when a client asks
    #[arg(long)]
    pub no_display: bool,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };

        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(root) = &self.root {
            settings.root = root.clone();
        }
        if let Some(bind) = self.bind {
            settings.bind_address = bind;
        }
        settings.beep |= self.beep;
        settings.guide_mode |= self.guide;
        settings.verbose |= self.verbose;
        if self.no_display {
            settings.display.enabled = false;
        }

        settings.validate()?;
        if settings.port == 0 {
            return Err(ConfigError::Invalid {
                field: "port",
                reason: "an ephemeral port cannot be reached by camera clients".to_string(),
            });
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_flags() {
        let cli = Cli::try_parse_from(["imageserver"]).unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from(["imageserver", "-p", "7001", "-b", "-g", "-v"]).unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings.port, 7001);
        assert!(settings.beep);
        assert!(settings.guide_mode);
        assert!(settings.verbose);
    }

    #[test]
    fn test_gcslbt_alias() {
        let cli = Cli::try_parse_from(["imageserver", "--gcslbt"]).unwrap();
        assert!(cli.guide);
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("imageserver.toml");
        std::fs::write(
            &path,
            "port = 7100\nbeep = true\nroot = \"/from/file\"\n[display]\nenabled = true\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "imageserver",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7200",
            "--no-display",
        ])
        .unwrap();
        let settings = cli.settings().unwrap();

        assert_eq!(settings.port, 7200);
        assert!(settings.beep);
        assert_eq!(settings.root, PathBuf::from("/from/file"));
        assert!(!settings.display.enabled);
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["imageserver", "-p", "70000"]).is_err());

        let cli = Cli::try_parse_from(["imageserver", "-p", "0"]).unwrap();
        assert!(matches!(
            cli.settings(),
            Err(ConfigError::Invalid { field: "port", .. })
        ));
    }
}
