use std::io::{self, stdout};

use blob_envelope::config::Config;
use clap::{Arg, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};

use crate::flags;

pub const NAME: &str = "reconcile";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Reports '.encrypted' and '.dek' objects missing their other half (deletes nothing)")
        .arg(flags::log_level_arg())
        .arg(flags::config_file_arg())
        .arg(flags::bucket_arg())
        .arg(
            Arg::new("PREFIX")
                .long("prefix")
                .short('p')
                .help("Only checks object names starting with the prefix")
                .required(false)
                .num_args(1),
        )
}

pub async fn execute(
    log_level: &str,
    config_file: &str,
    bucket: &str,
    prefix: Option<&str>,
) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    );

    let config = Config::load(config_file)?;
    config.validate()?;

    let manager = config.envelope_manager().await;
    let orphans = manager.find_orphans(bucket, prefix).await?;

    if orphans.is_empty() {
        execute!(
            stdout(),
            SetForegroundColor(Color::Green),
            Print(format!("\nno orphaned artifacts in '{}'\n", bucket)),
            ResetColor
        )?;
        return Ok(());
    }

    execute!(
        stdout(),
        SetForegroundColor(Color::Red),
        Print(format!(
            "\nfound {} orphaned artifact(s) in '{}'\n",
            orphans.len(),
            bucket
        )),
        ResetColor
    )?;
    for o in orphans.iter() {
        println!("{}", o);
    }
    Ok(())
}
