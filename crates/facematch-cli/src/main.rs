use anyhow::Result;
use clap::{Parser, Subcommand};
use facematch_core::{Label, Profile};
use serde::Deserialize;
use std::path::PathBuf;

mod input;

#[zbus::proxy(
    interface = "org.facematch.FaceMatch1",
    default_service = "org.facematch.FaceMatch1",
    default_path = "/org/facematch/FaceMatch1"
)]
trait FaceMatch {
    async fn enroll(&self, label: &str, embeddings_json: &str, profile_json: &str) -> zbus::Result<String>;
    async fn enroll_selected(&self, profile_json: &str) -> zbus::Result<String>;
    async fn remove(&self, label: &str) -> zbus::Result<bool>;
    async fn rebuild(&self) -> zbus::Result<String>;
    async fn recognize(&self, detections_json: &str) -> zbus::Result<String>;
    async fn select(&self, index: u32) -> zbus::Result<String>;
    async fn selected_profile(&self) -> zbus::Result<String>;
    async fn list_labels(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facematch", about = "facematch face registry CLI")]
struct Cli {
    /// Print raw JSON replies instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ProfileArgs {
    /// Display name; also the label the face is enrolled under
    #[arg(long)]
    name: String,
    /// LinkedIn handle
    #[arg(long)]
    linkedin: Option<String>,
    /// Telegram handle
    #[arg(long)]
    telegram: Option<String>,
}

impl From<ProfileArgs> for Profile {
    fn from(args: ProfileArgs) -> Self {
        Profile {
            name: args.name,
            linkedin: args.linkedin,
            telegram: args.telegram,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one or more embeddings under a label
    Enroll {
        /// Label to enroll under (defaults to the profile name)
        #[arg(short, long)]
        label: Option<String>,
        /// JSON file holding one embedding or an array of embeddings
        #[arg(short, long)]
        embeddings: PathBuf,
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Enroll the currently selected face under a profile
    Register {
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Remove a label and all of its embeddings
    Remove {
        label: String,
    },
    /// Rebuild the matcher snapshot from the registry
    Rebuild,
    /// Match the detections of a new image
    Recognize {
        /// JSON file: [{"bounding_box": {...}, "embedding": [...]}, ...]
        detections: PathBuf,
    },
    /// Select a face of the current image
    Select {
        index: u32,
    },
    /// Show the profile of the selected face
    Profile,
    /// List enrolled labels
    List,
    /// Show daemon status
    Status,
}

#[derive(Deserialize)]
struct FaceLine {
    index: usize,
    display_label: String,
    is_selected: bool,
    bounding_box: facematch_core::BoundingBox,
}

#[derive(Deserialize)]
struct LabelLine {
    label: Label,
    embeddings: usize,
    profile: Option<Profile>,
}

fn print_faces(raw: &str, json: bool) -> Result<()> {
    if json {
        println!("{raw}");
        return Ok(());
    }
    let faces: Vec<FaceLine> = serde_json::from_str(raw)?;
    if faces.is_empty() {
        println!("No faces");
    }
    for face in faces {
        let marker = if face.is_selected { '*' } else { ' ' };
        let b = face.bounding_box;
        println!(
            "{marker} [{}] {} at ({:.0}, {:.0}) {:.0}x{:.0}",
            face.index, face.display_label, b.x, b.y, b.width, b.height
        );
    }
    Ok(())
}

fn print_profile(profile: &Profile) {
    println!("Name:     {}", profile.name);
    if let Some(linkedin) = &profile.linkedin {
        println!("LinkedIn: https://linkedin.com/in/{linkedin}");
    }
    if let Some(telegram) = &profile.telegram {
        println!("Telegram: https://t.me/{telegram}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = zbus::Connection::session().await?;
    let proxy = FaceMatchProxy::new(&conn).await?;
    tracing::debug!("connected to facematchd");

    match cli.command {
        Commands::Enroll {
            label,
            embeddings,
            profile,
        } => {
            let embeddings = input::parse_embeddings(&input::read_file(&embeddings)?)?;
            let profile = Profile::from(profile);
            let label = label.unwrap_or_else(|| profile.name.clone());
            let reply = proxy
                .enroll(
                    &label,
                    &serde_json::to_string(&embeddings)?,
                    &serde_json::to_string(&profile)?,
                )
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                println!("Enrolled {} embedding(s) under {label}", embeddings.len());
            }
        }
        Commands::Register { profile } => {
            let profile = Profile::from(profile);
            let reply = proxy
                .enroll_selected(&serde_json::to_string(&profile)?)
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                println!("Saved face for {}", profile.name);
            }
        }
        Commands::Remove { label } => {
            if proxy.remove(&label).await? {
                println!("Removed {label}");
            } else {
                println!("No such label: {label}");
            }
        }
        Commands::Rebuild => {
            let reply = proxy.rebuild().await?;
            println!("{reply}");
        }
        Commands::Recognize { detections } => {
            let detections = input::parse_detections(&input::read_file(&detections)?)?;
            let reply = proxy
                .recognize(&serde_json::to_string(&detections)?)
                .await?;
            print_faces(&reply, cli.json)?;
        }
        Commands::Select { index } => {
            let reply = proxy.select(index).await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_faces(&format!("[{reply}]"), false)?;
            }
        }
        Commands::Profile => {
            let reply = proxy.selected_profile().await?;
            if reply.is_empty() {
                println!("No profile for the selected face");
            } else if cli.json {
                println!("{reply}");
            } else {
                print_profile(&serde_json::from_str(&reply)?);
            }
        }
        Commands::List => {
            let reply = proxy.list_labels().await?;
            if cli.json {
                println!("{reply}");
            } else {
                let labels: Vec<LabelLine> = serde_json::from_str(&reply)?;
                if labels.is_empty() {
                    println!("No labels enrolled");
                }
                for line in labels {
                    let name = line.profile.map(|p| p.name).unwrap_or_default();
                    println!("{:<24} {:>3} embedding(s)  {name}", line.label.as_str(), line.embeddings);
                }
            }
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            println!("{reply}");
        }
    }

    Ok(())
}
