// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! FluxION FOTA - device-side agent
//!
//! Feeds firmware streams into the engine, triggers upgrades and services the
//! delayed jobs (activation of a new application image, late results).

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fluxion_fota::config::{DEFAULT_CONFIG_PATH, load_config};
use fluxion_fota::{
    Engine, ExecActivator, ForceErrorCase, LogPublisher, PackageBuilder, SlotId, StartupOptions,
    UpdateResult, UpgradeOutcome, encode_multi_package,
};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CHUNK_SIZE: usize = 4096;

#[derive(Parser)]
#[command(name = "fluxion-fota")]
#[command(author, version, about = "FluxION multi-slot firmware update agent")]
struct Cli {
    /// Path to the JSON config (created with defaults when missing)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Result code to conclude the application update with after start-up
    #[arg(long, value_parser = parse_update_result)]
    delayed_result: Option<UpdateResult>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show state, result and versions of every slot
    Status,

    /// Stream a package file into the engine as if received from the manager
    Download {
        /// Slot the stream is opened on
        slot: SlotId,
        file: PathBuf,
    },

    /// Apply a downloaded image, together with its linked slots
    Upgrade {
        slot: SlotId,

        /// Upgrade these slots in the same request instead of the linked ones
        #[arg(long = "with")]
        with: Vec<SlotId>,
    },

    /// Drop everything staged for a slot
    Reset { slot: SlotId },

    /// Restore state and service delayed jobs until none remain
    Run,

    /// Build a package, or a multi-package stream when given several images
    Pack {
        #[arg(short, long)]
        out: PathBuf,

        /// <slot>:<version>:<path>
        #[arg(long = "image", required = true, value_parser = parse_image)]
        images: Vec<ImageArg>,

        /// <slot>:<linked-slot>
        #[arg(long = "link", value_parser = parse_link)]
        links: Vec<(SlotId, SlotId)>,

        /// <slot>:<code>
        #[arg(long = "force-error", value_parser = parse_force_error)]
        force_errors: Vec<(SlotId, ForceErrorCase)>,
    },
}

#[derive(Debug, Clone)]
struct ImageArg {
    slot: SlotId,
    version: String,
    path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluxion_fota=debug")),
        )
        .init();

    let Cli {
        config,
        delayed_result,
        command,
    } = Cli::parse();

    match command {
        Commands::Pack {
            out,
            images,
            links,
            force_errors,
        } => pack(&out, &images, &links, &force_errors)?,
        Commands::Status => {
            let engine = open_engine(&config, delayed_result)?;
            print_status(&engine);
        }
        Commands::Download { slot, file } => {
            let mut engine = open_engine(&config, delayed_result)?;
            let targets = download(&mut engine, slot, &file)?;
            for target in targets {
                println!(
                    "{target}: downloaded v{}",
                    engine.get_pending_version(target)
                );
            }
        }
        Commands::Upgrade { slot, with } => {
            let mut engine = open_engine(&config, delayed_result)?;
            match engine.perform_upgrade(slot, &with)? {
                UpgradeOutcome::Completed => info!("Upgrade of {slot} completed"),
                UpgradeOutcome::Pending => {
                    info!("Upgrade of {slot} pending");
                    drive_jobs(&mut engine).await;
                }
            }
            print_status(&engine);
        }
        Commands::Reset { slot } => {
            let mut engine = open_engine(&config, delayed_result)?;
            engine.reset(slot);
            print_status(&engine);
        }
        Commands::Run => {
            let mut engine = open_engine(&config, delayed_result)?;
            drive_jobs(&mut engine).await;
            print_status(&engine);
        }
    }

    Ok(())
}

fn open_engine(config_path: &Path, delayed_result: Option<UpdateResult>) -> Result<Engine> {
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    info!("Loaded config: data_dir={}", config.data_dir.display());

    // A re-executed image comes back up servicing jobs with the same config
    let activator = ExecActivator::new(vec![
        "--config".to_owned(),
        config_path.display().to_string(),
        "run".to_owned(),
    ]);
    let engine = Engine::new(
        config,
        Box::new(activator),
        Box::new(LogPublisher),
        StartupOptions { delayed_result },
    )?;
    Ok(engine)
}

/// Sleeps until the next job deadline and runs due jobs until none remain
async fn drive_jobs(engine: &mut Engine) {
    while let Some(deadline) = engine.next_deadline() {
        tokio::select! {
            () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                engine.run_due_jobs(std::time::Instant::now());
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, pending jobs dropped");
                break;
            }
        }
    }
}

fn download(engine: &mut Engine, slot: SlotId, path: &Path) -> Result<Vec<SlotId>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    engine.open(slot)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        engine.write(slot, &buf[..read])?;
    }

    Ok(engine.finish(slot)?)
}

fn print_status(engine: &Engine) {
    for slot in SlotId::ALL {
        let record = engine.slot(slot);
        println!(
            "{:<16} {:<12} {:<28} current={} pending={}",
            slot.to_string(),
            record.state.to_string(),
            record.result.to_string(),
            record.current_version,
            record.pending_version()
        );
        if !record.linked.is_empty() || !record.conflicting.is_empty() {
            println!(
                "{:<16} linked={:?} conflicting={:?}",
                "", record.linked, record.conflicting
            );
        }
    }
    println!(
        "severity={:?} last_state_change={} update_deadline={}",
        engine.severity(),
        engine.last_state_change(),
        engine
            .update_deadline()
            .map_or_else(|| "none".to_owned(), |d| d.to_string())
    );
}

fn pack(
    out: &Path,
    images: &[ImageArg],
    links: &[(SlotId, SlotId)],
    force_errors: &[(SlotId, ForceErrorCase)],
) -> Result<()> {
    let mut packages = Vec::with_capacity(images.len());

    for image in images {
        let body = std::fs::read(&image.path)
            .with_context(|| format!("Failed to read {}", image.path.display()))?;

        let mut builder = PackageBuilder::new(image.slot, image.version.clone());
        for &(_, linked) in links.iter().filter(|(from, _)| *from == image.slot) {
            builder = builder.link(linked);
        }
        if let Some(&(_, case)) = force_errors.iter().find(|(slot, _)| *slot == image.slot) {
            builder = builder.force_error(case);
        }

        packages.push(builder.build(&body)?);
        info!(
            "Packed {} v{} ({} bytes)",
            image.slot,
            image.version,
            body.len()
        );
    }

    let stream = match packages.as_slice() {
        [single] => single.clone(),
        [] => bail!("No images given"),
        _ => encode_multi_package(&packages)?,
    };
    std::fs::write(out, &stream).with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Wrote {} ({} bytes)", out.display(), stream.len());
    Ok(())
}

fn parse_slot(s: &str) -> Result<SlotId, String> {
    s.parse().map_err(|e: fluxion_fota::FotaError| e.to_string())
}

fn parse_image(s: &str) -> Result<ImageArg, String> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(slot), Some(version), Some(path)) if !version.is_empty() && !path.is_empty() => {
            Ok(ImageArg {
                slot: parse_slot(slot)?,
                version: version.to_owned(),
                path: PathBuf::from(path),
            })
        }
        _ => Err(format!("expected <slot>:<version>:<path>, got '{s}'")),
    }
}

fn parse_link(s: &str) -> Result<(SlotId, SlotId), String> {
    let (from, to) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <slot>:<linked-slot>, got '{s}'"))?;
    Ok((parse_slot(from)?, parse_slot(to)?))
}

fn parse_force_error(s: &str) -> Result<(SlotId, ForceErrorCase), String> {
    let (slot, code) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <slot>:<code>, got '{s}'"))?;
    let code: u16 = code
        .parse()
        .map_err(|e| format!("invalid force-error code '{code}': {e}"))?;
    let case = ForceErrorCase::from_code(code)
        .ok_or_else(|| format!("unknown force-error code {code}"))?;
    Ok((parse_slot(slot)?, case))
}

fn parse_update_result(s: &str) -> Result<UpdateResult, String> {
    let code: u8 = s
        .parse()
        .map_err(|e| format!("invalid result code '{s}': {e}"))?;
    UpdateResult::from_u8(code).ok_or_else(|| format!("unknown result code {code}"))
}
