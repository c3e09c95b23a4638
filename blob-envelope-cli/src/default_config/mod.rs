use std::io::{self, stdout, Error, ErrorKind};

use blob_envelope::config::Config;
use clap::{Arg, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};

use crate::flags;

pub const NAME: &str = "default-config";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Writes a default configuration")
        .arg(flags::log_level_arg())
        .arg(
            Arg::new("CONFIG_FILE_PATH")
                .long("config-file-path")
                .short('c')
                .help("The config file to create")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("PROJECT")
                .long("project")
                .help("Sets the project that owns the key hierarchy")
                .required(false)
                .num_args(1)
                .default_value("default"),
        )
        .arg(
            Arg::new("STORAGE")
                .long("storage")
                .help("Sets the object-storage backend")
                .required(false)
                .num_args(1)
                .value_parser(["local", "s3"])
                .default_value("local"),
        )
        .arg(
            Arg::new("KMS")
                .long("kms")
                .help("Sets the KMS backend")
                .required(false)
                .num_args(1)
                .value_parser(["local", "aws"])
                .default_value("local"),
        )
        .arg(
            Arg::new("ROOT_DIR")
                .long("root-dir")
                .help("Sets the root directory for the local backends")
                .required(false)
                .num_args(1)
                .default_value("/var/lib/blob-envelope"),
        )
        .arg(
            Arg::new("REGION")
                .long("region")
                .help("Sets the AWS region for the S3 and KMS backends")
                .required(false)
                .num_args(1)
                .default_value("us-west-2"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub log_level: String,
    pub config_file_path: String,
    pub project: String,
    pub storage: String,
    pub kms: String,
    pub root_dir: String,
    pub region: String,
}

pub fn execute(opts: Options) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );

    let local = Config::default_local(&opts.root_dir, &opts.project);
    let aws = Config::default_aws(&opts.region, &opts.project);

    let mut config = local.clone();
    if opts.storage == "s3" {
        config.storage = aws.storage.clone();
    }
    if opts.kms == "aws" {
        config.kms = aws.kms.clone();
        config.kms_key = aws.kms_key.clone();
    }
    config.validate()?;

    if std::path::Path::new(&opts.config_file_path).exists() {
        return Err(Error::new(
            ErrorKind::AlreadyExists,
            format!("config file {} already exists", opts.config_file_path),
        ));
    }
    config.sync(&opts.config_file_path)?;

    let d = config.encode_yaml()?;
    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!("\nSaved configuration: '{}'\n", opts.config_file_path)),
        ResetColor
    )?;
    println!("{}", d);

    Ok(())
}
