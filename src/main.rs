//! ccd_daq command-line front end.
//!
//! ```bash
//! ccd_daq expose --duration 5 --n 3 --savedir /data/raw
//! ccd_daq expose --bias --n 10
//! ccd_daq expose --download-last-image
//! ccd_daq cool set -20
//! ccd_daq inspect /data/raw/AL694M-21040501_0_light.fits
//! ```
//!
//! Runs against the built-in simulated camera. A vendor backend plugs in by
//! implementing `CameraDevice`.

use anyhow::{bail, Context, Result};
use ccd_daq::acquisition::{
    BinFactors, CycleMode, CyclePlan, ExposureIntent, FrameKind, Orchestrator, ReadyWait,
};
use ccd_daq::config::AppConfig;
use ccd_daq::hardware::{CameraDevice, MockCamera};
use ccd_daq::session::Session;
use ccd_daq::storage::{FitsReader, FitsWriter};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Exposure acquisition for cooled CCD/CMOS cameras")]
struct Cli {
    /// TOML configuration file (environment variables CCD_DAQ_* override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take exposures and save them as FITS files
    Expose(ExposeArgs),
    /// Cooler control
    Cool {
        #[command(subcommand)]
        action: CoolAction,
    },
    /// Show the attached camera
    List,
    /// Print the header and size of a saved frame
    Inspect { path: PathBuf },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum CoolAction {
    /// Print cooler telemetry
    Get {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cool towards a setpoint in degrees C
    Set {
        #[arg(allow_negative_numbers = true)]
        celsius: f64,
    },
    /// Switch cooling off
    Disable,
}

#[derive(Args, Debug)]
struct ExposeArgs {
    /// Exposure duration in seconds
    #[arg(long, required_unless_present_any = ["bias", "download_last_image"])]
    duration: Option<f64>,

    /// Dark frame (shutter closed)
    #[arg(long, conflicts_with_all = ["bias", "flat"])]
    dark: bool,

    /// Bias frame (shortest exposure the sensor supports)
    #[arg(long, conflicts_with = "flat")]
    bias: bool,

    /// Flat frame
    #[arg(long)]
    flat: bool,

    #[arg(long, default_value_t = 1)]
    binx: u32,

    #[arg(long, default_value_t = 1)]
    biny: u32,

    /// Number of exposures
    #[arg(long = "n", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    count: u32,

    /// Output directory (defaults to the configured one)
    #[arg(long)]
    savedir: Option<PathBuf>,

    /// Explicit output file name
    #[arg(long)]
    filename: Option<String>,

    #[arg(long)]
    disable_overscan: bool,

    /// Download the frame still held by the sensor instead of exposing
    #[arg(long)]
    download_last_image: bool,

    /// Extra header card, repeatable
    #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
    header: Vec<String>,

    /// Focus position written to FOCUSPOS
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    focus_pos: i64,

    /// Use the guider sensor
    #[arg(long)]
    guider: bool,

    #[arg(long)]
    exposure_retries: Option<u32>,

    #[arg(long)]
    download_retries: Option<u32>,
}

impl ExposeArgs {
    fn frame_kind(&self) -> FrameKind {
        if self.dark {
            FrameKind::Dark
        } else if self.bias {
            FrameKind::Bias
        } else if self.flat {
            FrameKind::Flat
        } else {
            FrameKind::Light
        }
    }

    fn extra_headers(&self) -> Vec<(String, String)> {
        self.header
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }
}

fn camera(guider: bool) -> MockCamera {
    MockCamera::builder()
        .sensor_id(u32::from(guider))
        .realtime(true)
        .build()
}

async fn expose(config: &mut AppConfig, args: ExposeArgs) -> Result<()> {
    if let Some(n) = args.exposure_retries {
        config.retry.exposure_retries = n;
    }
    if let Some(n) = args.download_retries {
        config.retry.download_retries = n;
    }

    // Biases and redownloads ignore the duration.
    let intent = ExposureIntent::light(args.duration.unwrap_or(0.0))
        .with_kind(args.frame_kind())
        .with_bin(BinFactors::new(args.binx, args.biny)?)
        .with_overscan(!args.disable_overscan);

    let plan = CyclePlan {
        count: args.count,
        mode: if args.download_last_image {
            CycleMode::Redownload
        } else {
            CycleMode::Expose
        },
        output_dir: args.savedir.clone().unwrap_or_else(|| config.output_dir()),
        extension: config.storage.extension.clone(),
        filename: args.filename.clone(),
        focus_position: args.focus_pos,
        extra_headers: args.extra_headers(),
    };

    let wait = ReadyWait::from_config(&config.readiness);
    let cancel = wait.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling readiness wait");
            cancel.cancel();
        }
    });

    let mut session = Session::open(camera(args.guider)).await?;
    let outcomes = Orchestrator::new(&mut session, FitsWriter::new(), config)
        .with_ready_wait(wait)
        .run_cycle(&intent, &plan)
        .await?;
    session.close();

    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    for outcome in &outcomes {
        match outcome {
            Ok(saved) => println!("Saved {}", saved.path.display()),
            Err(err) => eprintln!("Exposure failed: {err}"),
        }
    }
    if failed > 0 {
        bail!("{failed} of {} exposures failed", outcomes.len());
    }
    Ok(())
}

async fn cool(action: CoolAction) -> Result<()> {
    let session = Session::open(camera(false)).await?;
    let device = session.device();
    match action {
        CoolAction::Get { json } => {
            let snapshot = device.cooler_snapshot().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{snapshot}");
            }
        }
        CoolAction::Set { celsius } => {
            let geometry = session.geometry();
            let min = f64::from(geometry.cooler_setpoint_min);
            let max = f64::from(geometry.cooler_setpoint_max);
            let setpoint = celsius.clamp(min, max);
            if setpoint != celsius {
                tracing::warn!(requested = celsius, setpoint, "Setpoint clamped to sensor range");
            }
            device.set_cooler_setpoint(setpoint).await?;
            println!("Cooler setpoint {setpoint:.2} C");
        }
        CoolAction::Disable => {
            device.disable_cooler().await?;
            println!("Cooler disabled");
        }
    }
    session.close();
    Ok(())
}

async fn list() -> Result<()> {
    let session = Session::open(camera(false)).await?;
    println!("{}\t{}", session.serial(), session.device().model());
    session.close();
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let mut reader =
        FitsReader::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    if let Some((width, height)) = reader.dimensions() {
        println!("{width} x {height}");
    }
    for key in ["DATE", "DATE-OBS", "IMAGETYP", "SERIALNO"] {
        if let Ok(value) = reader.key_string(key) {
            println!("{key:<9}= {value}");
        }
    }
    for key in ["EXPTIME", "EGAIN", "CCD-TEMP", "HSINKT"] {
        if let Ok(value) = reader.key_f64(key) {
            println!("{key:<9}= {value}");
        }
    }
    for key in ["XBINNING", "YBINNING", "FOCUSPOS"] {
        if let Ok(value) = reader.key_i64(key) {
            println!("{key:<9}= {value}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    ccd_daq::logging::init_from_config(&config)?;

    match cli.command {
        Command::Expose(args) => expose(&mut config, args).await,
        Command::Cool { action } => cool(action).await,
        Command::List => list().await,
        Command::Inspect { path } => inspect(&path),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("ccd_daq").chain(args.iter().copied()))
    }

    #[test]
    fn expose_needs_a_duration_unless_bias_or_redownload() {
        assert!(parse(&["expose"]).is_err());
        assert!(parse(&["expose", "--dark"]).is_err());
        assert!(parse(&["expose", "--bias"]).is_ok());
        assert!(parse(&["expose", "--download-last-image"]).is_ok());

        let cli = parse(&["expose", "--duration", "2.5", "--n", "3"]).unwrap();
        match cli.command {
            Command::Expose(args) => {
                assert_eq!(args.duration, Some(2.5));
                assert_eq!(args.count, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn exposure_count_must_be_positive() {
        assert!(parse(&["expose", "--duration", "1", "--n", "0"]).is_err());
    }

    #[test]
    fn repeated_headers_pair_up() {
        let cli = parse(&[
            "expose", "--bias", "--header", "OBJECT", "M31", "--header", "OBJECT", "M33",
        ])
        .unwrap();
        let Command::Expose(args) = cli.command else {
            panic!("expected expose");
        };
        assert_eq!(
            args.extra_headers(),
            vec![
                ("OBJECT".to_string(), "M31".to_string()),
                ("OBJECT".to_string(), "M33".to_string()),
            ]
        );
    }
}
