use std::{fmt::Display, path::Path, path::PathBuf};

use clap::Parser;
use eyre::{bail, Context};
use skiff_keys::{private::PrivateKey, HostKeyAlgorithm};

#[derive(clap::Parser)]
struct Args {
    #[command(subcommand)]
    cmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Print the public key and fingerprint of a base64 encoded private key
    Info {
        /// Show the private key. WARNING: This will display the private key
        #[arg(long)]
        show_private: bool,
        id_file: PathBuf,
    },
    /// Generate a new host key, the public key is written next to it with a `.pub` suffix
    Generate {
        #[arg(short, long = "type", default_value_t = KeyType::Rsa)]
        type_: KeyType,
        #[arg(short, long, default_value_t = String::default())]
        comment: String,
        #[arg(short, long)]
        path: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone)]
enum KeyType {
    Rsa,
    Dss,
}

impl Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa => f.write_str("rsa"),
            Self::Dss => f.write_str("dss"),
        }
    }
}

impl From<KeyType> for skiff_keys::KeyType {
    fn from(value: KeyType) -> Self {
        match value {
            KeyType::Rsa => Self::Rsa,
            KeyType::Dss => Self::Dss,
        }
    }
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();

    match args.cmd {
        Subcommand::Info {
            id_file,
            show_private,
        } => info(&id_file, show_private),
        Subcommand::Generate {
            type_,
            comment,
            path,
        } => generate(type_, comment, &path),
    }
}

/// The file does not say which kind of key it holds, so every kind is tried.
fn read_key(id_file: &Path) -> eyre::Result<(PrivateKey, String)> {
    let file = std::fs::read_to_string(id_file)
        .wrap_err_with(|| format!("reading file {}", id_file.display()))?;

    for key_type in [skiff_keys::KeyType::Rsa, skiff_keys::KeyType::Dss] {
        if let Ok(key) = PrivateKey::from_base64(key_type, &file) {
            return Ok((key, file.trim().to_owned()));
        }
    }
    bail!("{} does not contain an RSA or DSA key", id_file.display())
}

fn info(id_file: &Path, show_private: bool) -> eyre::Result<()> {
    let (key, encoded) = read_key(id_file)?;
    let public_key = key.public_key();

    println!("{public_key}");
    println!("  fingerprint: {}", public_key.fingerprint());
    let algorithms = HostKeyAlgorithm::ALL
        .iter()
        .filter(|alg| alg.key_type() == key.key_type())
        .map(|alg| alg.name())
        .collect::<Vec<_>>();
    println!("  host key algorithms: {}", algorithms.join(", "));
    if show_private {
        println!("  private key: {encoded}");
    }
    Ok(())
}

fn generate(type_: KeyType, comment: String, path: &Path) -> eyre::Result<()> {
    let key = PrivateKey::generate(type_.into(), &mut rand::rngs::OsRng)
        .wrap_err("generating key")?;
    let public_key = key.public_key();

    println!("{public_key} {comment}");
    println!("  fingerprint: {}", public_key.fingerprint());

    let mut pubkey_path = path.to_path_buf().into_os_string();
    pubkey_path.push(".pub");
    std::fs::write(&pubkey_path, format!("{public_key} {comment}\n"))
        .wrap_err_with(|| format!("writing to {:?}", pubkey_path))?;

    let privkey = key.to_base64().wrap_err("encoding key")?;

    std::fs::write(path, format!("{privkey}\n"))
        .wrap_err_with(|| format!("writing to {}", path.display()))?;

    Ok(())
}
