use anyhow::Context;
use clap::Parser;
use melody_client::api::ApiClient;
use melody_client::flow::{combine_prompt, SongFlow};
use melody_proto::config::Config;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "imalody")]
#[command(about = "Turn an image into a song via the imalody backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Image to analyze
    image: PathBuf,

    /// Extra instructions appended to the generated prompt
    /// (e.g. "make it more orchestral")
    #[arg(short, long)]
    instructions: Option<String>,

    /// Where to write the audio clip (default: melody-<timestamp>.<ext>)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Backend base URL (overrides the config file and IMALODY_BACKEND_URL)
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = melody_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("imalody.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // Allow RUST_LOG override; default to debug for app code but suppress noisy
    // connection-level DEBUG from HTTP client internals (hyper_util, reqwest).
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "debug,hyper_util=warn,reqwest=warn,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("imalody log: {}", log_path.display());
    tracing::info!("imalody starting…");

    let mut config = Config::load().unwrap_or_default();
    if let Some(url) = cli.base_url {
        config.backend.base_url = url;
    }
    tracing::info!("backend: {}", config.backend.base_url);

    let client = Arc::new(ApiClient::new(
        config.backend.base_url.clone(),
        config.backend.request_timeout(),
    )?);
    let flow = SongFlow::new(client, &config.polling);

    let file_name = cli
        .image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image")
        .to_string();
    let bytes = tokio::fs::read(&cli.image)
        .await
        .with_context(|| format!("failed to read {}", cli.image.display()))?;

    println!("Analyzing {}…", cli.image.display());
    let prompt = flow
        .analyze_image(&file_name, bytes)
        .await?
        .into_text()
        .context("analysis returned a non-text result")?;
    println!("Prompt: {}", prompt);

    let final_prompt = combine_prompt(&prompt, cli.instructions.as_deref());
    println!("Generating music…");
    let clip = flow
        .generate_music(&final_prompt)
        .await?
        .into_audio()
        .context("generation returned a non-audio result")?;

    let output = cli.output.unwrap_or_else(|| {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        PathBuf::from(format!("melody-{}.{}", stamp, clip.extension()))
    });
    tokio::fs::write(&output, &clip.data)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "Wrote {} ({} bytes, {})",
        output.display(),
        clip.data.len(),
        clip.media_type
    );
    Ok(())
}
