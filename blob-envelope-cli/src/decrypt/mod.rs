use std::io::{self, stdout};

use blob_envelope::{artifacts, config::Config};
use clap::{Arg, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use dialoguer::{theme::ColorfulTheme, Select};

use crate::flags::{self, KeyFlags};

pub const NAME: &str = "decrypt";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Restores an envelope-encrypted object in place and deletes the encrypted pair")
        .arg(flags::log_level_arg())
        .arg(flags::config_file_arg())
        .arg(flags::bucket_arg())
        .arg(
            Arg::new("SOURCE")
                .long("source")
                .short('s')
                .help("Sets the encrypted object name (must end with '.encrypted')")
                .required(true)
                .num_args(1),
        )
        .args(flags::key_args())
        .arg(
            Arg::new("SKIP_PROMPT")
                .long("skip-prompt")
                .help("Skips the confirmation before the encrypted pair is deleted")
                .required(false)
                .num_args(0),
        )
}

#[derive(Debug)]
pub struct Options {
    pub log_level: String,
    pub config_file: String,
    pub bucket: String,
    pub source: String,
    pub key: KeyFlags,
    pub skip_prompt: bool,
}

pub async fn execute(opts: Options) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );
    log::info!("starting {} {} with {:?}", crate::APP_NAME, NAME, opts);

    let config = Config::load(&opts.config_file)?;
    config.validate()?;
    let key_ref = config.key_ref(
        opts.key.location.as_deref(),
        opts.key.key_ring.as_deref(),
        opts.key.key.as_deref(),
    )?;

    // fail on a bad name before prompting
    let restored = artifacts::restored_name(&opts.source)?;
    let dek = artifacts::dek_name_for_encrypted(&opts.source)?;

    if !opts.skip_prompt {
        execute!(
            stdout(),
            SetForegroundColor(Color::Red),
            Print(format!(
                "\nDecrypting '{}/{}' into '{}/{}' deletes '{}' and '{}' afterwards\n",
                opts.bucket, opts.source, opts.bucket, restored, opts.source, dek
            )),
            ResetColor
        )?;
        let options = &[
            String::from("No, I am not ready to decrypt"),
            format!("Yes, let's decrypt '{}' with '{}'", opts.source, key_ref),
        ];
        let selected = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select your 'decrypt' option")
            .items(&options[..])
            .default(0)
            .interact()?;
        if selected == 0 {
            return Ok(());
        }
    }

    let manager = config.envelope_manager().await;
    let restored = manager
        .download_and_decrypt(&opts.bucket, &opts.source, &key_ref)
        .await?;

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print(format!("\nrestored '{}/{}'\n", opts.bucket, restored)),
        ResetColor
    )?;
    Ok(())
}
