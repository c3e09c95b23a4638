use std::{
    io::{self, Error, ErrorKind},
    path::Path,
};

use blob_envelope::config::Config;
use clap::{Arg, Command};

use crate::flags::{self, KeyFlags};

pub const NAME: &str = "upload";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Uploads a local file as is or envelope-encrypted")
        .arg(flags::log_level_arg())
        .arg(
            Arg::new("ACTION")
                .long("action")
                .short('a')
                .help("Uploads the file as is (plain) or as '.encrypted' + '.dek' (encrypted)")
                .required(false)
                .num_args(1)
                .value_parser(["plain", "encrypted"])
                .default_value("encrypted"),
        )
        .arg(flags::config_file_arg())
        .arg(flags::bucket_arg())
        .arg(
            Arg::new("SOURCE")
                .long("source")
                .short('s')
                .help("Sets the local file to upload")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("DESTINATION")
                .long("destination")
                .short('d')
                .help("Sets the object name in the bucket")
                .required(true)
                .num_args(1),
        )
        .args(flags::key_args())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Plain,
    Encrypted,
}

#[derive(Debug)]
pub struct Options {
    pub log_level: String,
    pub action: Action,
    pub config_file: String,
    pub bucket: String,
    pub source: String,
    pub destination: String,
    pub key: KeyFlags,
}

pub async fn execute(opts: Options) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );
    log::info!("starting {} {} with {:?}", crate::APP_NAME, NAME, opts);

    let config = Config::load(&opts.config_file)?;
    config.validate()?;

    let source = Path::new(&opts.source);
    if !source.exists() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("source file {} does not exist", opts.source),
        ));
    }

    let manager = config.envelope_manager().await;
    match opts.action {
        Action::Plain => {
            manager
                .upload_plain(&opts.bucket, source, &opts.destination)
                .await?;
            log::info!("uploaded '{}' to '{}/{}'", opts.source, opts.bucket, opts.destination);
        }
        Action::Encrypted => {
            let key_ref = config.key_ref(
                opts.key.location.as_deref(),
                opts.key.key_ring.as_deref(),
                opts.key.key.as_deref(),
            )?;
            manager
                .encrypt_and_upload(&opts.bucket, source, &opts.destination, &key_ref)
                .await?;
            log::info!(
                "uploaded '{}' encrypted with '{}' to '{}/{}.encrypted'",
                opts.source,
                key_ref,
                opts.bucket,
                opts.destination
            );
        }
    }

    Ok(())
}
