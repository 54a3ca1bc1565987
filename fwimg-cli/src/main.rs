use std::fs;
use std::path::{Path, PathBuf};

use fwimg::crypto::{Scheme, SecureEngine};
use fwimg::flash::mem::MemFlash;
use fwimg::flash::FlashAccess;
use fwimg::kms::{KeyObject, Kms};
use fwimg::pack::{self, PackOptions, PackedImage};
use fwimg::slot::SlotId;
use fwimg::watchdog::Watchdog;
use fwimg::{constants, BootOutcome, FwImg};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use k256::ecdsa::{SigningKey, VerifyingKey};

mod board;

use board::{Board, Profile};

const AES_KEY_FILE: &str = "aes.key";
const SIGNING_KEY_FILE: &str = "ecdsa.key";
const VERIFYING_KEY_FILE: &str = "ecdsa.pub";

/// Payload bytes handed to the loader per write.
const LOAD_CHUNK: usize = 4096;

#[derive(clap::Parser)]
#[clap(author, version, about)]
#[clap(propagate_version = true)]
struct Cli {
    /// The main command to execute
    #[clap(subcommand)]
    command: Command,

    /// The flash dump to operate on
    #[clap(long, default_value = "flash.bin")]
    flash: PathBuf,

    /// The target board, which selects the flash geometry
    #[clap(long, arg_enum, default_value = "l4")]
    board: Board,

    /// The install profile
    #[clap(long, arg_enum, default_value = "dual")]
    profile: Profile,

    /// The crypto scheme images are protected with
    #[clap(long, arg_enum, default_value = "aes-gcm")]
    scheme: SchemeArg,

    /// Directory holding the key files
    #[clap(long, default_value = "keys")]
    keys: PathBuf,

    /// Lowest firmware version the installer accepts
    #[clap(long, default_value_t = 0)]
    min_version: u16,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate a fresh AES key and ECDSA key pair in the key directory
    Keygen,

    /// Pack a firmware binary into an installable image
    Pack {
        /// The firmware binary
        input: PathBuf,
        /// Where to write the packed image
        output: PathBuf,
        /// The firmware version
        #[clap(long)]
        version: u16,
        /// Only ship the firmware from this offset on (partial update)
        #[clap(long)]
        partial_offset: Option<u32>,
    },

    /// Create an erased flash dump for the selected board and profile
    Init {
        /// Overwrite an existing dump
        #[clap(long)]
        force: bool,
    },

    /// Store a packed image in the download slot
    Load {
        /// The packed image
        image: PathBuf,
    },

    /// Install the candidate in the download slot
    Install,

    /// Run the boot sequence and report what would be launched
    Boot,

    /// Show the state of the slots
    Status,

    /// Revoke the active firmware
    Invalidate,
}

#[derive(clap::ArgEnum, Clone, Copy)]
enum SchemeArg {
    AesGcm,
    AesCbc,
    Sha256,
}

impl From<SchemeArg> for Scheme {
    fn from(scheme: SchemeArg) -> Self {
        match scheme {
            SchemeArg::AesGcm => Scheme::AesGcm,
            SchemeArg::AesCbc => Scheme::AesCbcSha256Ecdsa,
            SchemeArg::Sha256 => Scheme::Sha256Ecdsa,
        }
    }
}

/// Ticks a spinner whenever a long flash loop refreshes the watchdog.
struct ProgressWatchdog(ProgressBar);

impl ProgressWatchdog {
    fn new(message: &'static str) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_message(message);
        Self(spinner)
    }
}

impl Watchdog for ProgressWatchdog {
    fn refresh(&mut self) {
        self.0.tick();
    }
}

impl Drop for ProgressWatchdog {
    fn drop(&mut self) {
        self.0.finish_and_clear();
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let cli = Cli::parse();

    handle(cli)
}

fn handle(cli: Cli) -> Result<(), Error> {
    // Commands that do not touch the flash dump.
    match &cli.command {
        Command::Keygen => return keygen(&cli.keys),

        Command::Pack {
            input,
            output,
            version,
            partial_offset,
        } => {
            let firmware = fs::read(input)?;
            let mut engine = SecureEngine::new(load_kms(&cli.keys)?, cli.scheme.into());
            let signing_key = load_signing_key(&cli.keys)?;

            let mut options = PackOptions::new(*version);
            options.partial_offset = *partial_offset;
            let image = pack::pack_image(&mut engine, signing_key.as_ref(), &firmware, &options)?;
            fs::write(output, image.to_bytes())?;

            eprintln!(
                "Packed v{} ({} bytes, {} payload bytes)",
                image.header.fw_version,
                image.header.fw_size,
                image.payload.len()
            );
            return Ok(());
        }

        _ => {}
    }

    match cli.board {
        Board::L4 | Board::G0 | Board::G4 => run::<8, 2048>(cli),
        Board::L5 | Board::Wb55 => run::<8, 4096>(cli),
        Board::H7 => run::<32, 0x2_0000>(cli),
    }
}

fn run<const WRITE: usize, const PAGE: usize>(cli: Cli) -> Result<(), Error> {
    let mut config = cli.board.config(cli.profile);
    config.scheme = cli.scheme.into();
    config.min_version = cli.min_version;
    let capacity = config.required_capacity();
    log::debug!("{:?} flash layout: {:?}", cli.board, config);

    if let Command::Init { force } = cli.command {
        if cli.flash.exists() && !force {
            eprintln!("{} already exists; use --force to overwrite", cli.flash.display());
            return Ok(());
        }
        fs::write(&cli.flash, vec![constants::ERASED_BYTE; capacity])?;
        eprintln!("Created {} ({} bytes)", cli.flash.display(), capacity);
        return Ok(());
    }

    let data = fs::read(&cli.flash)?;
    if data.len() < capacity {
        return Err(Error::FlashTooSmall {
            needed: capacity,
            found: data.len(),
        });
    }

    let device = MemFlash::<WRITE, PAGE>::from_bytes(data);
    let ecc = device.ecc_counter();
    let flash = FlashAccess::new(device, config.flash_base, ecc);
    let watchdog = ProgressWatchdog::new("working on flash...");
    let mut img = FwImg::new(flash, load_kms(&cli.keys)?, watchdog, config)?;

    let result = command(&mut img, &cli.command);

    // persist whatever happened to the flash, even on failure
    fs::write(&cli.flash, img.into_flash().into_bytes())?;
    result
}

fn command<const WRITE: usize, const PAGE: usize>(
    img: &mut FwImg<MemFlash<WRITE, PAGE>, ProgressWatchdog>,
    command: &Command,
) -> Result<(), Error> {
    match command {
        Command::Load { image } => {
            let packed = PackedImage::from_bytes(&fs::read(image)?)?;
            let header = img.begin_download(&packed.header.encode())?;

            let bar = ProgressBar::new(packed.payload.len() as u64);
            bar.set_style(ProgressStyle::with_template(
                "{bar:40.cyan/blue} {bytes}/{total_bytes}",
            )?);
            for (i, piece) in packed.payload.chunks(LOAD_CHUNK).enumerate() {
                img.write_download((i * LOAD_CHUNK) as u32, piece)?;
                bar.inc(piece.len() as u64);
            }
            bar.finish_and_clear();

            eprintln!("Loaded v{}", header.fw_version);
        }

        Command::Install => {
            let version = img.install_new_version()?;
            eprintln!("Installed v{}", version);
        }

        Command::Boot => match img.boot()? {
            BootOutcome::Launch { version } => println!("launch v{}", version),
            BootOutcome::NoValidFirmware => println!("no valid firmware"),
        },

        Command::Status => {
            println!("active:   {:?}", img.slot_state(SlotId::Active)?);
            if let Some(version) = img.active_version()? {
                println!("version:  {}", version);
            }
            if let Some(floor) = img.version_floor()? {
                println!("floor:    {}", floor);
            }
            println!("download: {:?}", img.slot_state(SlotId::Download)?);
            if let Some(status) = img.swap_status()? {
                println!(
                    "swap:     {:?} {}/{} chunks",
                    status.kind, status.swapped, status.chunks
                );
            }
        }

        Command::Invalidate => {
            img.invalidate_current_firmware()?;
            eprintln!("OK");
        }

        Command::Keygen | Command::Pack { .. } | Command::Init { .. } => {
            unreachable!("handled earlier")
        }
    }

    Ok(())
}

fn keygen(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir)?;

    let mut aes = [0_u8; constants::AES_KEY_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut aes);
    let signing = SigningKey::random(&mut rand::thread_rng());

    fs::write(dir.join(AES_KEY_FILE), hex::encode(aes))?;
    fs::write(dir.join(SIGNING_KEY_FILE), hex::encode(signing.to_bytes()))?;
    fs::write(
        dir.join(VERIFYING_KEY_FILE),
        hex::encode(signing.verifying_key().to_sec1_bytes()),
    )?;

    eprintln!("Keys written to {}", dir.display());
    Ok(())
}

fn read_hex(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    Ok(Some(hex::decode(text.trim())?))
}

/// Provisions whichever keys exist in `dir`.
fn load_kms(dir: &Path) -> Result<Kms, Error> {
    let mut kms = Kms::new();

    if let Some(bytes) = read_hex(&dir.join(AES_KEY_FILE))? {
        let key = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(AES_KEY_FILE))?;
        kms.add_object(constants::AES_KEY_HANDLE, KeyObject::Aes128(key))?;
    }

    if let Some(bytes) = read_hex(&dir.join(VERIFYING_KEY_FILE))? {
        let key =
            VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| Error::InvalidKey(VERIFYING_KEY_FILE))?;
        kms.add_object(constants::ECDSA_KEY_HANDLE, KeyObject::EcdsaPublic(key))?;
    }

    Ok(kms)
}

fn load_signing_key(dir: &Path) -> Result<Option<SigningKey>, Error> {
    read_hex(&dir.join(SIGNING_KEY_FILE))?
        .map(|bytes| SigningKey::from_slice(&bytes).map_err(|_| Error::InvalidKey(SIGNING_KEY_FILE)))
        .transpose()
}

#[derive(Debug)]
enum Error {
    Fwimg(fwimg::Error),
    Kms(fwimg::kms::Error),
    Io(std::io::Error),
    Hex(hex::FromHexError),
    Template(indicatif::style::TemplateError),
    InvalidKey(&'static str),
    FlashTooSmall { needed: usize, found: usize },
}

impl From<fwimg::Error> for Error {
    fn from(error: fwimg::Error) -> Self {
        Self::Fwimg(error)
    }
}

impl From<fwimg::kms::Error> for Error {
    fn from(error: fwimg::kms::Error) -> Self {
        Self::Kms(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(error: hex::FromHexError) -> Self {
        Self::Hex(error)
    }
}

impl From<indicatif::style::TemplateError> for Error {
    fn from(error: indicatif::style::TemplateError) -> Self {
        Self::Template(error)
    }
}
