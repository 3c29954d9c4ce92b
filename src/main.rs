// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Parser;
use ice_client_rs::{
    cfg::{
        cli::{Cli, Command, resolve_config_path},
        config::RegionTable,
        logger::{init_logger, init_logger_stderr},
    },
    ctx::Context,
    masters, pkg,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _logger_guard = if cli.quiet {
        None
    } else {
        Some(
            resolve_config_path(Path::new("config/logger.yaml"))
                .and_then(|p| init_logger(&p.to_string_lossy()))
                .or_else(|_| init_logger_stderr("info"))
                .context("failed to initialize logging")?,
        )
    };

    let loaded;
    let table: &RegionTable = match &cli.regions {
        Some(path) => {
            loaded = resolve_config_path(path)
                .and_then(RegionTable::load_from_file)
                .context("failed to resolve or load the region table")?;
            &loaded
        },
        None => RegionTable::builtin()?,
    };
    let ctx = Context::new(table, &cli.region, cli.bundle.as_deref(), &cli.memo)?;

    match cli.command {
        Command::Bootstrap => ctx.bootstrap().await,
        Command::AcceptTos => ctx.accept_tos().await,
        Command::Resolve => {
            println!("{}", ctx.bundle);
            Ok(())
        },
        Command::CurrentMaster => {
            let memo = ctx.memo().read()?;
            println!("{}", memo.latest_complete_master.unwrap_or_default());
            Ok(())
        },
        Command::Invalidate => ctx.memo().update(|memo| {
            memo.resume_data = None;
        }),
        Command::DlMaster { master, force } => masters::sync(&ctx, master, force).await,
        Command::PkgSync {
            master,
            validate_only,
            lang,
            groups,
        } => pkg::sync(&ctx, master, validate_only, lang, &groups).await,
        Command::PkgGc {
            master,
            dry_run,
            lang,
        } => pkg::gc(&ctx, master, dry_run, lang).map(|_| ()),
        Command::MasterGc { dry_run } => masters::gc(&ctx, dry_run).map(|_| ()),
        Command::DecryptMaster { file } => {
            let out = masters::decrypt_offline(table, &cli.region, &file)?;
            info!("decrypted to {out:?}");
            Ok(())
        },
    }
}
