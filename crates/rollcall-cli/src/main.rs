use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceRecord, GallerySummary};
use rollcall_hw::Camera;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    fn rebuild_gallery(&self) -> zbus::Result<String>;
    fn enroll_image(&self, label: &str, image: &[u8]) -> zbus::Result<String>;
    fn remove_label(&self, label: &str) -> zbus::Result<String>;
    fn list_labels(&self) -> zbus::Result<String>;
    fn start_capture(&self) -> zbus::Result<bool>;
    fn stop_capture(&self) -> zbus::Result<bool>;
    fn current_frame(&self) -> zbus::Result<Vec<u8>>;
    fn attendance_snapshot(&self) -> zbus::Result<String>;
    fn attendance_delta(&self) -> zbus::Result<Vec<String>>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a face image to the corpus and rebuild the gallery
    Enroll {
        /// Person the image belongs to
        #[arg(short, long)]
        label: String,
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Remove every image of a label and rebuild the gallery
    Remove {
        label: String,
    },
    /// Rebuild the gallery from the corpus
    Rebuild,
    /// List enrolled labels with their image counts
    Labels,
    /// Start a capture session (resets attendance)
    Start,
    /// Stop the capture session and release the camera
    Stop,
    /// Print who has been marked present this session
    Attendance {
        /// Raw JSON instead of the text report
        #[arg(long)]
        json: bool,
    },
    /// Follow attendance as people are marked, until capture stops or Ctrl-C
    Live {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Save the latest captured frame as a JPEG
    Frame {
        out: PathBuf,
    },
    /// Show daemon status
    Status,
    /// List local V4L2 capture devices
    Devices,
}

/// One line per record: `label - HH:MM:SS - Present`.
fn attendance_report(records: &[AttendanceRecord]) -> String {
    records
        .iter()
        .map(|r| format!("{} - {} - {}\n", r.label, r.marked_at.format("%H:%M:%S"), r.status))
        .collect()
}

fn print_summary(json: &str) -> Result<()> {
    let summary: GallerySummary = serde_json::from_str(json).context("malformed gallery summary")?;
    println!(
        "gallery: {} entries across {} labels (built {})",
        summary.entries,
        summary.labels.len(),
        summary.built_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}

async fn connect() -> Result<RollcallProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on the session bus")
}

async fn follow(proxy: &RollcallProxy<'_>, interval: Duration) -> Result<()> {
    let mut printed = 0usize;
    loop {
        let records: Vec<AttendanceRecord> = serde_json::from_str(&proxy.attendance_snapshot().await?)?;
        if records.len() < printed {
            // A new session started underneath us.
            printed = 0;
        }
        print!("{}", attendance_report(&records[printed..]));
        printed = records.len();

        let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
        if status["capturing"] != serde_json::Value::Bool(true) {
            println!("capture stopped; {printed} present");
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            list_devices();
            Ok(())
        }
        command => run(command).await,
    }
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

async fn run(command: Commands) -> Result<()> {
    let proxy = connect().await?;

    match command {
        Commands::Enroll { label, image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            tracing::debug!(label = %label, bytes = bytes.len(), "enrolling");
            print_summary(&proxy.enroll_image(&label, &bytes).await?)?;
        }
        Commands::Remove { label } => {
            print_summary(&proxy.remove_label(&label).await?)?;
        }
        Commands::Rebuild => {
            print_summary(&proxy.rebuild_gallery().await?)?;
        }
        Commands::Labels => {
            let labels: BTreeMap<String, usize> = serde_json::from_str(&proxy.list_labels().await?)?;
            if labels.is_empty() {
                println!("No labels enrolled");
            }
            for (label, count) in labels {
                println!("{label}\t{count}");
            }
        }
        Commands::Start => {
            if proxy.start_capture().await? {
                println!("capture started");
            } else {
                println!("capture already running");
            }
        }
        Commands::Stop => {
            if proxy.stop_capture().await? {
                println!("capture stopped");
            } else {
                println!("capture was not running");
            }
        }
        Commands::Attendance { json } => {
            let raw = proxy.attendance_snapshot().await?;
            if json {
                println!("{raw}");
            } else {
                let records: Vec<AttendanceRecord> = serde_json::from_str(&raw)?;
                if records.is_empty() {
                    println!("Nobody marked present yet");
                }
                print!("{}", attendance_report(&records));
            }
        }
        Commands::Live { interval_ms } => {
            follow(&proxy, Duration::from_millis(interval_ms)).await?;
        }
        Commands::Frame { out } => {
            let jpeg = proxy.current_frame().await?;
            if jpeg.is_empty() {
                bail!("no frame captured yet; is capture running?");
            }
            std::fs::write(&out, &jpeg).with_context(|| format!("writing {}", out.display()))?;
            println!("wrote {} ({} bytes)", out.display(), jpeg.len());
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => list_devices(),
    }

    Ok(())
}
