//! CLI entry point for the water phantom.
//!
//! # Usage
//!
//! Home the rig and move to (1, 1, 3) cm:
//! ```bash
//! water-phantom move 1 1 3
//! ```
//!
//! Report positions without homing:
//! ```bash
//! water-phantom status
//! ```
//!
//! List serial ports with their USB ids:
//! ```bash
//! water-phantom ports
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phantom_core::port_resolver;
use phantom_driver_cylinder::{CylinderDriver, PositionUnit};
use phantom_driver_trinamic::{Motor, StepperDriver};
use std::path::PathBuf;
use water_phantom::config::{PhantomConfig, DEFAULT_CONFIG_PATH};
use water_phantom::logging::{self, OutputFormat};
use water_phantom::{PhantomResult, WaterPhantom};

#[derive(Parser)]
#[command(name = "water-phantom")]
#[command(about = "Motion control for the water phantom", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    /// Run without the cylinder (z is ignored)
    #[arg(long, global = true)]
    no_cylinder: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Home, then move to coordinates in cm
    Move {
        /// Top carriage position (cm)
        x: f64,
        /// Bottom carriage position (cm)
        y: f64,
        /// Cylinder position (cm, sign ignored)
        #[arg(allow_negative_numbers = true)]
        z: f64,
        /// Return right after dispatching the moves
        #[arg(long)]
        no_block: bool,
    },

    /// Home the stepper axes and zero the cylinder
    Home,

    /// Report positions and reached flags without moving anything
    Status,

    /// List serial ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PhantomConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    if cli.no_cylinder {
        config.cylinder.enabled = false;
    }
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Move { x, y, z, no_block } => move_to(&config, x, y, z, !no_block).await,
        Commands::Home => home(&config).await,
        Commands::Status => status(&config).await,
        Commands::Ports => ports(),
    }
}

async fn move_to(config: &PhantomConfig, x: f64, y: f64, z: f64, block: bool) -> Result<()> {
    let mut phantom = WaterPhantom::connect(config).await.context("startup failed")?;

    let mut outcome = phantom.move_to_coords(x, y, z, block).await;
    if outcome.is_ok() {
        if block {
            outcome = print_positions(&phantom).await;
        } else {
            println!("Moves dispatched to ({x}, {y}, {z}) cm");
        }
    }

    phantom.finish(outcome).await.context("move failed")
}

async fn home(config: &PhantomConfig) -> Result<()> {
    let phantom = WaterPhantom::connect(config).await.context("homing failed")?;
    let outcome = print_positions(&phantom).await;
    phantom.finish(outcome).await?;
    Ok(())
}

async fn status(config: &PhantomConfig) -> Result<()> {
    let stepper = StepperDriver::open(config.stepper.clone()).await?;
    for motor in Motor::ALL {
        println!(
            "{:<14} {:>8.3} cm  reached={}  homed={}",
            motor.axis().to_string(),
            stepper.position_cm(motor).await?,
            stepper.motor_reached(motor).await?,
            stepper.motor_homed(motor).await?,
        );
    }
    stepper.disconnect().await;

    if config.cylinder.enabled {
        let cylinder = CylinderDriver::open(config.cylinder.driver.clone()).await?;
        let percent = cylinder.get_position(PositionUnit::Percent).await?;
        println!(
            "{:<14} {:>8.3} cm  ({percent:.1} %)  state={:?}",
            phantom_core::AxisId::Z.to_string(),
            phantom_driver_cylinder::percent_to_cm(percent),
            cylinder.position_reached().await?,
        );
        cylinder.disconnect().await;
    }
    Ok(())
}

fn ports() -> Result<()> {
    let ports = port_resolver::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.usb_id {
            Some(id) => println!(
                "{:<24} {id}  {}",
                port.path,
                port.product.as_deref().unwrap_or("")
            ),
            None => println!("{:<24} (not USB)", port.path),
        }
    }
    Ok(())
}

async fn print_positions(phantom: &WaterPhantom) -> PhantomResult<()> {
    for (axis, cm) in phantom.positions().await? {
        println!("{:<14} {cm:>8.3} cm", axis.to_string());
    }
    Ok(())
}
