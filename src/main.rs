//! luks2ctl - administration tool for LUKS2 volumes.
//!
//! Formats volumes, manages keyslots and tokens, backs up headers and runs
//! resumable reencryption.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use luks2_core::config::{
    pbkdf2_params, reencrypt_params, DEFAULT_KEYSLOTS_SIZE, DEFAULT_METADATA_SIZE,
    DEFAULT_VOLUME_KEY_SIZE,
};
use luks2_core::crypto::{HashAlg, KdfParams};
use luks2_core::header::Keyslot;
use luks2_core::reencrypt::ReencryptStatus;
use luks2_core::storage::FileDevice;
use luks2_core::{
    logging, CancelToken, Capabilities, Feature, FormatOptions, ReencryptParams, Reencryptor,
    Volume,
};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "luks2ctl")]
#[command(author, version, about, long_about = None)]
#[command(
    about = "Manage LUKS2 encrypted volumes",
    long_about = "Format LUKS2 volumes, manage passphrase keyslots and tokens, and reencrypt data in place."
)]
struct Cli {
    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a device or image file as a LUKS2 volume
    Format {
        /// Device or image file
        device: PathBuf,

        /// Create the image file with this many bytes
        #[arg(long)]
        size: Option<u64>,

        /// Volume label
        #[arg(long)]
        label: Option<String>,

        /// Subsystem tag
        #[arg(long)]
        subsystem: Option<String>,

        /// Data sector size in bytes
        #[arg(long, default_value = "512")]
        sector_size: u32,

        /// Size of one header copy in bytes
        #[arg(long, default_value_t = DEFAULT_METADATA_SIZE)]
        metadata_size: u64,

        /// Size of the keyslots area in bytes
        #[arg(long, default_value_t = DEFAULT_KEYSLOTS_SIZE)]
        keyslots_size: u64,

        /// Start of the data segment in bytes (default: end of keyslots area)
        #[arg(long)]
        data_offset: Option<u64>,

        /// Volume key size in bytes (32 or 64)
        #[arg(long, default_value_t = DEFAULT_VOLUME_KEY_SIZE)]
        key_size: usize,

        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Print the header of a volume
    Dump {
        /// Device or image file
        device: PathBuf,
    },

    /// Add a passphrase keyslot
    AddKey {
        /// Device or image file
        device: PathBuf,

        /// Keyslot index (default: first free)
        #[arg(long)]
        slot: Option<usize>,

        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Wipe a keyslot
    RemoveKey {
        /// Device or image file
        device: PathBuf,

        /// Keyslot index
        slot: usize,
    },

    /// Check a passphrase without activating the volume
    TestPassphrase {
        /// Device or image file
        device: PathBuf,

        /// Only try this keyslot
        #[arg(long)]
        slot: Option<usize>,
    },

    /// Add a JSON token
    TokenAdd {
        /// Device or image file
        device: PathBuf,

        /// Token JSON (default: read from stdin)
        #[arg(long)]
        json: Option<String>,
    },

    /// Print a token
    TokenGet {
        /// Device or image file
        device: PathBuf,

        /// Token index
        index: usize,

        /// Fail unless the token has this type
        #[arg(long = "type")]
        token_type: Option<String>,
    },

    /// Remove a token
    TokenRemove {
        /// Device or image file
        device: PathBuf,

        /// Token index
        index: usize,
    },

    /// Reencrypt the data segment with a new volume key
    Reencrypt {
        /// Device or image file
        device: PathBuf,

        /// Bytes rewritten per step
        #[arg(long, default_value_t = reencrypt_params::DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Save the header and keyslots area to a file
    HeaderBackup {
        /// Device or image file
        device: PathBuf,

        /// Backup file
        file: PathBuf,
    },

    /// Restore the header and keyslots area from a file
    HeaderRestore {
        /// Device or image file
        device: PathBuf,

        /// Backup file
        file: PathBuf,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// List optional features available in this build
    Capabilities,
}

#[derive(clap::Args)]
struct KdfArgs {
    /// Use PBKDF2 instead of Argon2id
    #[arg(long)]
    pbkdf2: bool,

    /// PBKDF2 iteration count
    #[arg(long, default_value_t = pbkdf2_params::DEFAULT_ITERATIONS)]
    iterations: u32,
}

impl KdfArgs {
    fn params(&self) -> KdfParams {
        if self.pbkdf2 {
            KdfParams::Pbkdf2 {
                hash: HashAlg::Sha256,
                iterations: self.iterations,
            }
        } else {
            KdfParams::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "info" });

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Format {
            device,
            size,
            label,
            subsystem,
            sector_size,
            metadata_size,
            keyslots_size,
            data_offset,
            key_size,
            kdf,
        } => {
            let opts = FormatOptions {
                sector_size,
                metadata_size,
                keyslots_size,
                data_offset,
                key_size,
                label,
                subsystem,
                ..Default::default()
            };
            cmd_format(&device, size, &opts, kdf.params())
        }

        Commands::Dump { device } => cmd_dump(&device),

        Commands::AddKey { device, slot, kdf } => cmd_add_key(&device, slot, kdf.params()),

        Commands::RemoveKey { device, slot } => cmd_remove_key(&device, slot),

        Commands::TestPassphrase { device, slot } => cmd_test_passphrase(&device, slot),

        Commands::TokenAdd { device, json } => cmd_token_add(&device, json),

        Commands::TokenGet {
            device,
            index,
            token_type,
        } => cmd_token_get(&device, index, token_type.as_deref()),

        Commands::TokenRemove { device, index } => cmd_token_remove(&device, index),

        Commands::Reencrypt {
            device,
            chunk_size,
            kdf,
        } => cmd_reencrypt(&device, chunk_size, kdf.params()),

        Commands::HeaderBackup { device, file } => cmd_header_backup(&device, &file),

        Commands::HeaderRestore {
            device,
            file,
            force,
        } => cmd_header_restore(&device, &file, force),

        Commands::Capabilities => cmd_capabilities(),
    }
}

fn prompt_password(prompt: &str) -> Result<String> {
    match rpassword::prompt_password(prompt) {
        Ok(password) => Ok(password),
        Err(_) => {
            eprint!("{}", prompt);
            io::stderr().flush()?;
            let mut password = String::new();
            io::stdin().read_line(&mut password)?;
            Ok(password.trim_end_matches(['\r', '\n']).to_string())
        }
    }
}

fn prompt_new_password(prompt: &str) -> Result<String> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm passphrase: ")?;
    if password != confirm {
        bail!("passphrases do not match");
    }
    if password.is_empty() {
        bail!("empty passphrase");
    }
    Ok(password)
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{} [y/N] ", question);
    io::stderr().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn open(path: &Path) -> Result<Volume<FileDevice>> {
    let device = FileDevice::open(path).with_context(|| format!("opening {}", path.display()))?;
    Volume::load(device).with_context(|| format!("reading LUKS2 header of {}", path.display()))
}

fn cmd_format(path: &Path, size: Option<u64>, opts: &FormatOptions, kdf: KdfParams) -> Result<()> {
    let device = match size {
        Some(size) => FileDevice::create(path, size)?,
        None => FileDevice::open(path)?,
    };
    let passphrase = prompt_new_password("Enter passphrase: ")?;

    let (mut volume, key) = Volume::format(device, opts)?;
    let slot = volume.add_keyslot(&key, passphrase.as_bytes(), kdf)?;

    println!("Volume formatted");
    println!("  UUID:        {}", volume.uuid());
    println!("  Data offset: {} bytes", volume.data_offset());
    println!("  Keyslot:     {}", slot);
    Ok(())
}

fn cmd_dump(path: &Path) -> Result<()> {
    let volume = open(path)?;
    let header = volume.header();
    let meta = &header.metadata;

    println!("LUKS2 header of {}", path.display());
    println!("==========================");
    println!("UUID:           {}", header.uuid);
    println!("Label:          {}", display_or_none(&header.label));
    println!("Subsystem:      {}", display_or_none(&header.subsystem));
    println!("Sequence id:    {}", header.seqid);
    println!("Metadata size:  {} bytes", header.metadata_size);
    println!("Keyslots size:  {} bytes", meta.config.keyslots_size);
    println!("Salt:           {}", hex::encode(header.salt));
    if !meta.config.requirements.is_empty() {
        println!("Requirements:   {}", meta.config.requirements.mandatory.join(", "));
    }

    println!();
    println!("Segments:");
    for (index, segment) in &meta.segments {
        println!(
            "  {}: {} offset {} size {:?} sector {}",
            index, segment.encryption, segment.offset, segment.size, segment.sector_size
        );
    }

    println!();
    println!("Keyslots:");
    for (index, keyslot) in &meta.keyslots {
        match keyslot {
            Keyslot::Luks2(k) => println!(
                "  {}: luks2 key {} bits, area {}+{}, kdf {:?}",
                index,
                k.key_size * 8,
                k.area.offset,
                k.area.size,
                k.kdf.params()
            ),
            Keyslot::Reencrypt(job) => println!(
                "  {}: reencrypt {} of data done, chunk {} bytes",
                index, job.offset, job.chunk_size
            ),
        }
    }

    println!();
    println!("Tokens:");
    for (index, token) in volume.tokens() {
        let status = volume.token_status(index)?;
        println!("  {}: {} {}", index, status, token);
    }

    println!();
    println!("Digests:");
    for (index, digest) in &meta.digests {
        println!(
            "  {}: {} {} iterations, keyslots {:?}, segments {:?}",
            index,
            digest.hash.name(),
            digest.iterations,
            digest.keyslots,
            digest.segments
        );
    }
    Ok(())
}

fn display_or_none(s: &str) -> &str {
    if s.is_empty() {
        "(none)"
    } else {
        s
    }
}

fn cmd_add_key(path: &Path, slot: Option<usize>, kdf: KdfParams) -> Result<()> {
    let mut volume = open(path)?;
    let existing = prompt_password("Enter any existing passphrase: ")?;
    let (_, key) = volume.open_any_keyslot(existing.as_bytes())?;
    let new = prompt_new_password("Enter new passphrase: ")?;

    let slot = match slot {
        Some(slot) => volume.add_keyslot_at(slot, &key, new.as_bytes(), kdf)?,
        None => volume.add_keyslot(&key, new.as_bytes(), kdf)?,
    };
    println!("Added keyslot {}", slot);
    Ok(())
}

fn cmd_remove_key(path: &Path, slot: usize) -> Result<()> {
    let mut volume = open(path)?;
    let passphrase = prompt_password("Enter any remaining passphrase: ")?;
    let (opened, _) = volume.open_any_keyslot(passphrase.as_bytes())?;
    if opened == slot && !confirm("This is the keyslot you unlocked with. Remove it anyway?")? {
        println!("Aborted");
        return Ok(());
    }

    volume.destroy_keyslot(slot)?;
    println!("Keyslot {} wiped", slot);
    Ok(())
}

fn cmd_test_passphrase(path: &Path, slot: Option<usize>) -> Result<()> {
    let mut volume = open(path)?;
    let passphrase = prompt_password("Enter passphrase: ")?;
    let opened = match slot {
        Some(slot) => {
            volume.open_keyslot(slot, passphrase.as_bytes())?;
            slot
        }
        None => volume.open_any_keyslot(passphrase.as_bytes())?.0,
    };
    println!("Keyslot {} unlocked", opened);
    Ok(())
}

fn cmd_token_add(path: &Path, json: Option<String>) -> Result<()> {
    let text = match json {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let mut volume = open(path)?;
    let index = volume.token_add(&text)?;
    println!("Token {} added", index);
    Ok(())
}

fn cmd_token_get(path: &Path, index: usize, token_type: Option<&str>) -> Result<()> {
    let volume = open(path)?;
    let token = volume.token_get(index, token_type)?;
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

fn cmd_token_remove(path: &Path, index: usize) -> Result<()> {
    let mut volume = open(path)?;
    volume.token_remove(index)?;
    println!("Token {} removed", index);
    Ok(())
}

fn cmd_reencrypt(path: &Path, chunk_size: u64, kdf: KdfParams) -> Result<()> {
    let mut volume = open(path)?;
    let reencryptor = Reencryptor::new(Arc::clone(volume.log()));

    let keys = match Reencryptor::status(&volume) {
        ReencryptStatus::None => {
            let old = prompt_password("Enter current passphrase: ")?;
            let new = prompt_new_password("Enter passphrase for the new key: ")?;
            let params = ReencryptParams {
                chunk_size,
                kdf,
                ..Default::default()
            };
            reencryptor.start(&mut volume, old.as_bytes(), new.as_bytes(), &params)?
        }
        status => {
            if status == ReencryptStatus::Crash {
                eprintln!("Previous run was interrupted, checking the last chunk");
            }
            let old = prompt_password("Enter old passphrase: ")?;
            let new = prompt_password("Enter new passphrase: ")?;
            reencryptor.unlock(&mut volume, old.as_bytes(), new.as_bytes())?
        }
    };

    let mut last_percent = u64::MAX;
    reencryptor.run(&mut volume, &keys, &CancelToken::new(), |p| {
        let percent = if p.total == 0 { 100 } else { p.done * 100 / p.total };
        if percent != last_percent {
            last_percent = percent;
            eprint!("\rProgress: {:>3}% ({} of {} bytes)", percent, p.done, p.total);
        }
    })?;
    eprintln!();
    println!("Reencryption finished");
    Ok(())
}

fn cmd_header_backup(path: &Path, file: &Path) -> Result<()> {
    let mut volume = open(path)?;
    volume.header_backup(file)?;
    println!("Header saved to {}", file.display());
    Ok(())
}

fn cmd_header_restore(path: &Path, file: &Path, force: bool) -> Result<()> {
    if !force && !confirm("This overwrites the header and every keyslot. Continue?")? {
        println!("Aborted");
        return Ok(());
    }
    let mut volume = open(path)?;
    volume.header_restore(file)?;
    println!("Header restored from {}", file.display());
    Ok(())
}

fn cmd_capabilities() -> Result<()> {
    let caps = Capabilities::detect();
    println!("Capabilities");
    println!("============");
    for feature in Feature::ALL {
        let mark = if caps.has(feature) { "yes" } else { "no" };
        println!("  {:<32} {}", feature.name(), mark);
    }
    println!("  {:<32} {}", "token module directory", caps.token_module_dir.display());
    Ok(())
}
