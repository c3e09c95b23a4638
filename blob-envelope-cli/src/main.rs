mod decrypt;
mod default_config;
mod flags;
mod reconcile;
mod upload;

use std::io;

use clap::{crate_version, Command};

pub const APP_NAME: &str = "blob-envelope";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Envelope-encrypts files into object storage")
        .subcommands(vec![
            upload::command(),
            decrypt::command(),
            reconcile::command(),
            default_config::command(),
        ])
        .get_matches();

    match matches.subcommand() {
        Some((upload::NAME, sub_matches)) => {
            let action = match flags::string(sub_matches, "ACTION").as_str() {
                "plain" => upload::Action::Plain,
                _ => upload::Action::Encrypted,
            };
            upload::execute(upload::Options {
                log_level: flags::log_level(sub_matches),
                action,
                config_file: flags::string(sub_matches, "CONFIG_FILE"),
                bucket: flags::string(sub_matches, "BUCKET"),
                source: flags::string(sub_matches, "SOURCE"),
                destination: flags::string(sub_matches, "DESTINATION"),
                key: flags::key_flags(sub_matches),
            })
            .await?;
        }

        Some((decrypt::NAME, sub_matches)) => {
            decrypt::execute(decrypt::Options {
                log_level: flags::log_level(sub_matches),
                config_file: flags::string(sub_matches, "CONFIG_FILE"),
                bucket: flags::string(sub_matches, "BUCKET"),
                source: flags::string(sub_matches, "SOURCE"),
                key: flags::key_flags(sub_matches),
                skip_prompt: sub_matches.get_flag("SKIP_PROMPT"),
            })
            .await?;
        }

        Some((reconcile::NAME, sub_matches)) => {
            reconcile::execute(
                &flags::log_level(sub_matches),
                &flags::string(sub_matches, "CONFIG_FILE"),
                &flags::string(sub_matches, "BUCKET"),
                sub_matches.get_one::<String>("PREFIX").map(String::as_str),
            )
            .await?;
        }

        Some((default_config::NAME, sub_matches)) => {
            default_config::execute(default_config::Options {
                log_level: flags::log_level(sub_matches),
                config_file_path: flags::string(sub_matches, "CONFIG_FILE_PATH"),
                project: flags::string(sub_matches, "PROJECT"),
                storage: flags::string(sub_matches, "STORAGE"),
                kms: flags::string(sub_matches, "KMS"),
                root_dir: flags::string(sub_matches, "ROOT_DIR"),
                region: flags::string(sub_matches, "REGION"),
            })?;
        }

        _ => unreachable!("unknown subcommand"),
    }

    Ok(())
}
