//! filerecon entry point.
//!
//! Replays captured transfer manifests through the reconstruction engine and exposes the
//! standalone decoders for inspecting files by hand.

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use filerecon::{
    config::Config,
    decode::{decompressor, ChunkedReader},
    errors::{Error, Result},
    metrics::init_metrics,
    replay::replay_file,
    sanitize::sanitize_filename_and_location,
    transfer::ContentEncoding,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// filerecon - rebuilds files from captured network transfers.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "FILERECON_CONFIG",
        default_value = "/etc/filerecon/config.yml"
    )]
    config: PathBuf,

    /// Log level.
    #[arg(long, value_name = "LEVEL", default_value = "")]
    log_level: String,

    /// Overrides the output directory from the configuration file.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines manifest of transfer events and reconstruct its files
    Replay {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },

    /// Decode a raw HTTP chunked body
    Dechunk {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Content-Encoding of the body inside the chunks (gzip, deflate)
        #[arg(long, value_name = "ENCODING")]
        encoding: Option<String>,
    },

    /// Show where a filename and location would be written
    Sanitize {
        #[arg(value_name = "FILENAME")]
        filename: String,

        #[arg(long, default_value = "")]
        location: String,

        /// Append "_" to executable extensions
        #[arg(long)]
        defang: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_file(&cli.config)?;
    if let Some(output) = &cli.output {
        config.reconstruction.output_directory = output.clone();
    }
    let log_level = if cli.log_level.is_empty() {
        config.log.level.clone()
    } else {
        cli.log_level.clone()
    };
    setup_logging(&log_level)?;
    cli_main(cli, config)
}

pub fn cli_main(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Replay { json, manifest } => {
            init_metrics();
            let report = replay_file(config.reconstruction, &manifest)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        Commands::Dechunk {
            input,
            output,
            encoding,
        } => {
            let encoding = encoding
                .as_deref()
                .map_or(ContentEncoding::Identity, ContentEncoding::from_header);
            let chunked = ChunkedReader::new(BufReader::new(File::open(&input)?));
            let mut reader = decompressor(encoding, BufReader::new(chunked))?;
            let mut writer = BufWriter::new(File::create(&output)?);
            let written = io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            info!("decoded {written} bytes into {}", output.display());
        }
        Commands::Sanitize {
            filename,
            location,
            defang,
        } => {
            if filename.is_empty() {
                return Err(Error::Usage("filename must not be empty".into()));
            }
            let (filename, location) =
                sanitize_filename_and_location(&filename, &location, None, defang);
            println!("{}", Path::new(&location).join(&filename).display());
        }
    }
    Ok(())
}

/// Configures the logging subsystem based on the specified log level.
fn setup_logging(level: &str) -> Result<()> {
    let filter: EnvFilter = format!("filerecon={level}")
        .parse()
        .map_err(|e| Error::Usage(format!("invalid log level {level:?}: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{cli_main, Cli};
    use clap::Parser;
    use filerecon::config::{Config, ReconstructionConfig};
    use std::fs;

    #[test]
    fn dechunk_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("body.chunked");
        let output = dir.path().join("body.txt");
        fs::write(&input, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        let config = Config {
            reconstruction: ReconstructionConfig::with_output_directory(dir.path().join("out")),
            log: Default::default(),
        };
        let cli = Cli::parse_from([
            "filerecon",
            "dechunk",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
        ]);
        cli_main(cli, config).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"Wikipedia");
    }
}
