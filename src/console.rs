//! Interactive operator console.
//!
//! Runs on its own OS thread so a blocking readline never stalls the
//! runtime. Commands are executed on the runtime through its handle.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config as EditorConfig, Editor};
use std::sync::Arc;
use std::thread;
use thermgate_server::commands::{self, Command};
use thermgate_server::GatewayContext;
use tokio::runtime::Handle;

/// Starts the console thread. Quitting or closing stdin stops the gateway.
pub fn spawn(ctx: Arc<GatewayContext>, handle: Handle) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("thermgate-console".to_string())
        .spawn(move || {
            if let Err(e) = run(&ctx, &handle) {
                tracing::error!("Console error: {}", e);
            }
            ctx.stop.stop();
        })
}

fn run(ctx: &Arc<GatewayContext>, handle: &Handle) -> Result<(), ReadlineError> {
    let config = EditorConfig::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    println!("{}", "thermgate console".bold().cyan());
    println!("Type 'help' for available commands.\n");

    loop {
        if ctx.stop.is_stopped() {
            break;
        }

        let prompt = format!("{} ", "thermgate>".cyan());
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(e) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match Command::parse(&line, ctx.table.running_port()) {
            Ok(command) => command,
            Err(e) => {
                println!("{}: {}\n", "Error".red(), e);
                continue;
            }
        };

        match handle.block_on(commands::execute(ctx, command)) {
            Ok(Some(output)) => println!("{}\n", output),
            Ok(None) => break,
            Err(e) => println!("{}: {}\n", "Error".red(), e),
        }
    }

    println!("{}", "Stopping gateway.".dimmed());
    Ok(())
}
