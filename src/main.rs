//! krux-provisioner - download, verify, flash and wipe Krux signing devices
//!
//! Thin command-line front end over the `krux_provisioner` library. Progress
//! from background sessions is marshalled through a channel to a printing
//! thread, so device output never blocks on the terminal.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use clap::{Parser, Subcommand};
use k256::ecdsa::SigningKey;
use log::warn;

use krux_provisioner::cache::ArtifactCache;
use krux_provisioner::commands::{
    detect_ports, download_firmware, download_release, release_firmware, set_failure_hook,
    spawn_flash, spawn_wipe, verify_firmware, ReleaseSource, SessionOutcome,
};
use krux_provisioner::config::{Device, DEFAULT_CHUNK_SIZE, RELEASE_PUBLIC_KEY};
use krux_provisioner::settings::{ProvisionerSettings, SettingsManager};
use krux_provisioner::verify::{PublicKey, SidecarSigner};
use krux_provisioner::{
    logging, Failure, FlashDriver, FlasherBackend, ProgressEvent, ProvisionError,
    ProvisionResult, StreamingDownloader, WipeDriver,
};

#[derive(Parser)]
#[command(name = "krux-provisioner", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warning, error, critical); defaults to $LOGLEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding settings and the release cache
    #[arg(long, global = true, default_value = ".krux-provisioner")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a firmware artifact
    Download {
        url: String,
        /// Treat the artifact as a signed release zip: verify, extract and
        /// cache it under this version
        #[arg(long)]
        release: Option<String>,
        /// Public key the release must be signed with; defaults to the
        /// official release key
        #[arg(long, requires = "release")]
        pubkey: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Verify an artifact's hash sidecar and signature
    Verify {
        artifact: PathBuf,
        #[arg(long)]
        signature: PathBuf,
        #[arg(long)]
        pubkey: PathBuf,
    },
    /// Write the `.sha256.txt` sidecar for a file
    Hash { file: PathBuf },
    /// Write the `.sha256.txt`, `.sig` and `.pem` sidecars for a file
    Sign {
        file: PathBuf,
        /// File holding the hex-encoded secp256k1 secret key
        #[arg(long)]
        key: PathBuf,
    },
    /// List serial ports matching a device's USB filter
    Ports {
        #[arg(long)]
        device: Option<Device>,
    },
    /// Flash a firmware image, or the device's image from a downloaded release
    Flash {
        #[arg(required_unless_present = "release")]
        firmware: Option<PathBuf>,
        /// Flash from this verified, cached release instead of a file
        #[arg(long, conflicts_with = "firmware")]
        release: Option<String>,
        #[arg(long)]
        device: Option<Device>,
        #[arg(long)]
        baudrate: Option<u32>,
    },
    /// Erase the device's flash
    Wipe {
        #[arg(long)]
        device: Option<Device>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_level.as_deref()) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    set_failure_hook(|failure: &Failure| eprintln!("{}", failure));

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", Failure::from(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ProvisionResult<bool> {
    let settings = SettingsManager::new(&cli.data_dir).load()?;

    match cli.command {
        Commands::Download {
            url,
            release,
            pubkey,
            chunk_size,
        } => {
            let downloader = StreamingDownloader::new()?;
            let resources = settings.resources_dir.clone();
            match release {
                Some(version) => {
                    let public_key = match pubkey {
                        Some(path) => PublicKey::load(&path)?,
                        None => PublicKey::from_pem(RELEASE_PUBLIC_KEY),
                    };
                    let source = ReleaseSource {
                        version,
                        url,
                        public_key,
                    };
                    let cache = ArtifactCache::new(&cli.data_dir);
                    let release = download_release(
                        downloader,
                        cache,
                        source,
                        resources,
                        chunk_size,
                        print_progress,
                    )
                    .await?;
                    println!("{}", release.extracted_path);
                }
                None => {
                    let artifact =
                        download_firmware(downloader, url, resources, chunk_size, print_progress)
                            .await?;
                    println!("{} {}", artifact.sha256, artifact.path.display());
                }
            }
            Ok(true)
        }

        Commands::Verify {
            artifact,
            signature,
            pubkey,
        } => {
            let artifact = verify_firmware(artifact, signature, pubkey).await?;
            println!("Signature OK: {}", artifact.path.display());
            Ok(true)
        }

        Commands::Hash { file } => {
            let mut signer = SidecarSigner::new(file);
            signer.make_hash()?;
            let path = signer.save_hash()?;
            println!("{}", path.display());
            Ok(true)
        }

        Commands::Sign { file, key } => {
            let key = load_signing_key(&key)?;
            let mut signer = SidecarSigner::new(file);
            signer.make_hash()?;
            signer.sign(&key)?;
            for path in [signer.save_hash()?, signer.save_signature()?, signer.save_pubkey()?] {
                println!("{}", path.display());
            }
            Ok(true)
        }

        Commands::Ports { device } => {
            let device = device.unwrap_or(settings.device);
            for port in detect_ports(device).await? {
                println!("{}\t{}\t{}", port.device, port.label, port.hwid);
            }
            Ok(true)
        }

        Commands::Flash {
            firmware,
            release,
            device,
            baudrate,
        } => {
            let (firmware, device) = match (firmware, release) {
                (_, Some(version)) => {
                    let device = device.unwrap_or(settings.device);
                    let cache = ArtifactCache::new(&cli.data_dir);
                    (release_firmware(&cache, &version, device)?, device)
                }
                (Some(firmware), None) => {
                    warn!(
                        target: "flasher",
                        "Flashing {} without release verification",
                        firmware.display()
                    );
                    let device = device
                        .or_else(|| Device::from_firmware_path(&firmware))
                        .unwrap_or(settings.device);
                    (firmware, device)
                }
                (None, None) => {
                    return Err(ProvisionError::validation(
                        "Either a firmware path or --release is required",
                    ))
                }
            };
            let baudrate = baudrate.unwrap_or(settings.baudrate);

            let (callback, printer) = progress_printer();
            let driver = FlashDriver::new(
                backend(&settings),
                firmware,
                device,
                baudrate,
                callback,
            )?;
            finish(spawn_flash(driver).await, printer)
        }

        Commands::Wipe { device } => {
            let device = device.unwrap_or(settings.device);
            let (callback, printer) = progress_printer();
            let driver = WipeDriver::new(backend(&settings), device, callback);
            finish(spawn_wipe(driver).await, printer)
        }
    }
}

fn load_signing_key(path: &Path) -> ProvisionResult<SigningKey> {
    let text = fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| ProvisionError::validation(format!("Invalid key file: {}", e)))?;
    SigningKey::from_slice(&bytes)
        .map_err(|_| ProvisionError::validation("Invalid secp256k1 secret key"))
}

fn backend(settings: &ProvisionerSettings) -> FlasherBackend {
    FlasherBackend::system(Path::new(&settings.ktool_path))
}

/// Progress callback feeding a printing thread.
fn progress_printer() -> (
    Box<dyn FnMut(ProgressEvent) + Send>,
    thread::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let printer = thread::spawn(move || {
        while let Ok(event) = rx.recv() {
            println!("{}", event.text());
        }
    });
    let callback = Box::new(move |event: ProgressEvent| {
        let _ = tx.send(event);
    });
    (callback, printer)
}

/// Wait for the printer to drain and map the outcome to success. Failures
/// were already printed by the failure hook.
fn finish(
    outcome: Result<SessionOutcome, tokio::task::JoinError>,
    printer: thread::JoinHandle<()>,
) -> ProvisionResult<bool> {
    let _ = printer.join();
    match outcome {
        Ok(outcome) => Ok(outcome.is_success()),
        Err(e) => {
            eprintln!("Session task failed: {}", e);
            Ok(false)
        }
    }
}

fn print_progress(done: u64, total: Option<u64>) {
    match total {
        Some(total) if total > 0 => eprint!("\r{} / {} bytes ({}%)", done, total, done * 100 / total),
        _ => eprint!("\r{} bytes", done),
    }
    if total == Some(done) {
        eprintln!();
    }
}
