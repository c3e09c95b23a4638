use clap::{Arg, ArgMatches};

/// Key reference flags; each one overrides the same field of the
/// configuration file's "kms_key" section.
#[derive(Debug, Clone, Default)]
pub struct KeyFlags {
    pub location: Option<String>,
    pub key_ring: Option<String>,
    pub key: Option<String>,
}

pub fn log_level_arg() -> Arg {
    Arg::new("LOG_LEVEL")
        .long("log-level")
        .help("Sets the log level")
        .required(false)
        .num_args(1)
        .value_parser(["debug", "info"])
        .default_value("info")
}

pub fn config_file_arg() -> Arg {
    Arg::new("CONFIG_FILE")
        .long("config-file")
        .short('c')
        .help("Sets the YAML configuration file path")
        .required(true)
        .num_args(1)
}

pub fn bucket_arg() -> Arg {
    Arg::new("BUCKET")
        .long("bucket")
        .short('b')
        .help("Sets the bucket name")
        .required(true)
        .num_args(1)
}

pub fn key_args() -> Vec<Arg> {
    vec![
        Arg::new("KEY")
            .long("key")
            .short('k')
            .help("Sets the KMS key id (overrides 'kms_key.key')")
            .required(false)
            .num_args(1),
        Arg::new("KEYRING")
            .long("keyring")
            .short('r')
            .help("Sets the KMS key ring id (overrides 'kms_key.key_ring')")
            .required(false)
            .num_args(1),
        Arg::new("LOCATION")
            .long("location")
            .short('l')
            .help("Sets the KMS location (overrides 'kms_key.location')")
            .required(false)
            .num_args(1),
    ]
}

pub fn string(m: &ArgMatches, id: &str) -> String {
    m.get_one::<String>(id).cloned().unwrap_or_default()
}

pub fn log_level(m: &ArgMatches) -> String {
    m.get_one::<String>("LOG_LEVEL")
        .cloned()
        .unwrap_or_else(|| String::from("info"))
}

pub fn key_flags(m: &ArgMatches) -> KeyFlags {
    KeyFlags {
        location: m.get_one::<String>("LOCATION").cloned(),
        key_ring: m.get_one::<String>("KEYRING").cloned(),
        key: m.get_one::<String>("KEY").cloned(),
    }
}
