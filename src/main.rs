//! Scriptwire CLI - inspect value encodings
//!
//! Commands:
//!   scriptwire encode <json>     - Text document to binary wire bytes (hex)
//!   scriptwire decode <hex>      - Binary wire bytes (hex) to a text document
//!   scriptwire signature <sig>   - Show the wasm type of an ABI signature

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use scriptwire::foreign::Signature;
use scriptwire::{BinaryCodec, Registry, Report, TextCodec, TextOptions};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "scriptwire")]
#[command(about = "Inspect script value encodings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a JSON argument list to binary wire bytes, printed as hex
    Encode {
        /// Path to the JSON document
        json_file: PathBuf,

        /// Resource names `^R^` sentinels may refer to
        #[arg(long = "resource", short = 'r')]
        resources: Vec<String>,

        /// Accept persisted-form sentinels
        #[arg(long)]
        serialize: bool,
    },

    /// Decode hex wire bytes and print the argument list as JSON
    Decode {
        /// Path to a file of hex digits; whitespace is ignored
        hex_file: PathBuf,

        /// Print the persisted form
        #[arg(long)]
        serialize: bool,
    },

    /// Show the wasm function type of an ABI signature string
    Signature {
        /// Signature such as `bes` (return kind first)
        signature: String,
    },
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            json_file,
            resources,
            serialize,
        } => encode_command(&json_file, &resources, serialize),
        Commands::Decode {
            hex_file,
            serialize,
        } => decode_command(&hex_file, serialize),
        Commands::Signature { signature } => signature_command(&signature),
    }
}

fn options(serialize: bool, pretty: bool) -> TextOptions {
    TextOptions { serialize, pretty }
}

fn summarize(report: &Report) {
    if !report.is_clean() {
        warn!(count = report.failures.len(), "some values could not be converted");
    }
}

fn encode_command(json_file: &Path, resources: &[String], serialize: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(json_file)
        .with_context(|| format!("Failed to read {}", json_file.display()))?;

    let registry = Registry::new();
    for name in resources {
        registry.add_resource(name);
    }

    let (list, report) = TextCodec::new(&registry, options(serialize, false))
        .decode_str(&text)
        .map_err(|e| anyhow!("Failed to decode document: {}", e))?;
    summarize(&report);

    let (bytes, report) = BinaryCodec::new(&registry).to_bytes(&list);
    summarize(&report);
    println!("{}", to_hex(&bytes));
    Ok(())
}

fn decode_command(hex_file: &Path, serialize: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(hex_file)
        .with_context(|| format!("Failed to read {}", hex_file.display()))?;
    let bytes = from_hex(&text)?;

    let registry = Registry::new();
    let (list, report) = BinaryCodec::new(&registry)
        .from_bytes(&bytes)
        .map_err(|e| anyhow!("Failed to decode wire bytes: {}", e))?;
    summarize(&report);

    let (document, report) = TextCodec::new(&registry, options(serialize, true))
        .encode_string(&list)
        .map_err(|e| anyhow!("Failed to render document: {}", e))?;
    summarize(&report);
    println!("{document}");
    Ok(())
}

fn signature_command(signature: &str) -> anyhow::Result<()> {
    let signature: Signature = signature
        .parse()
        .map_err(|e| anyhow!("Invalid signature: {}", e))?;

    let params: Vec<String> = signature
        .params
        .iter()
        .map(|kind| format!("{}:{}", kind.code(), kind.val_type()))
        .collect();
    let result = match signature.ret {
        Some(kind) => format!("{}:{}", kind.code(), kind.val_type()),
        None => "()".to_string(),
    };
    println!("({}) -> {}", params.join(", "), result);
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(anyhow!("Odd number of hex digits"));
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).with_context(|| format!("Invalid hex byte '{pair}'"))
        })
        .collect()
}
