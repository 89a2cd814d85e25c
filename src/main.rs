use std::{error::Error as _, path::Path};

use clap::Parser;
use inquire::{Confirm, InquireError, Password, Text};
use log::{error, info, warn};
use nicolive_dl::{
    auth::{self, AuthError, Credentials},
    availability::AccessLevel,
    ffmpeg::Ffmpeg,
    session::SessionConfig,
    util::{self, LIVE_URL_PREFIX},
    worker::{self, DownloadError, DownloadOptions, DownloadResult, OverwriteDecision},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Username/Email address
    #[arg(short, long, env = "NICOLIVE_USERNAME")]
    username: Option<String>,

    /// Password
    #[arg(short, long, env = "NICOLIVE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Live ID or Live URL (e.g. lv0123456789)
    #[arg(short, long, long_help = format!("Live ID or Live URL. Valid format of Live URL: {}lv0123456789, lv0123456789 is the Live ID in this case", LIVE_URL_PREFIX))]
    live_id: Option<String>,

    /// Whether an OTP is required to login (2FA enabled)
    #[arg(long)]
    otp_required: bool,

    /// Whether to save comments. Comments will be saved in the same directory as the video
    #[arg(long)]
    save_comments: bool,

    /// Output path template; {title} and {id} are substituted
    #[arg(short, long, default_value = worker::DEFAULT_OUTPUT_TEMPLATE)]
    output: String,

    /// Requested stream quality
    #[arg(long, default_value = "abr")]
    quality: String,

    /// Requested stream latency
    #[arg(long, default_value = "low")]
    latency: String,

    /// Path to the ffmpeg binary
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Overwrite an existing output file without asking
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Prompt failed")]
    Prompt(#[from] InquireError),
    #[error("Could not create HTTP client")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

fn prompt_otp() -> Option<String> {
    Text::new("OTP:").prompt().ok()
}

fn confirm_overwrite(path: &Path) -> OverwriteDecision {
    let answer = Confirm::new(&format!("Can you overwrite {}?", path.display()))
        .with_default(false)
        .prompt();

    match answer {
        Ok(true) => OverwriteDecision::Proceed,
        _ => OverwriteDecision::Abort,
    }
}

fn always_overwrite(_: &Path) -> OverwriteDecision {
    OverwriteDecision::Proceed
}

async fn run(args: Args) -> Result<(), CliError> {
    let username = match args.username {
        Some(u) => u,
        None => Text::new("Account:").prompt()?,
    };
    let password = match args.password {
        Some(p) => p,
        None => Password::new("Password:").without_confirmation().prompt()?,
    };
    let live_id = match args.live_id {
        Some(l) => l,
        None => Text::new("Live Id:").prompt()?,
    };

    let client = util::HttpClient::new()?;
    let credentials = Credentials { username, password };
    auth::login(&client, &credentials, args.otp_required.then_some(prompt_otp)).await?;

    let options = DownloadOptions {
        output: args.output,
        save_comments: args.save_comments,
        session: SessionConfig {
            quality: args.quality,
            latency: args.latency,
        },
    };
    let sink = Ffmpeg::new(args.ffmpeg);

    let result = if args.yes {
        worker::run(&client, &sink, &always_overwrite, &live_id, &options).await?
    } else {
        worker::run(&client, &sink, &confirm_overwrite, &live_id, &options).await?
    };

    match result {
        DownloadResult::Completed {
            video,
            comments,
            access,
        } => {
            info!("Video saved to {}", video.display());
            if access == AccessLevel::Partial {
                warn!("Only the trial watch part of the broadcast may have been recorded");
            }
            if let Some(comments) = comments {
                info!("Comments saved to {}", comments.display());
            }
        }
        DownloadResult::Skipped { video } => info!("Skipped {}", video.display()),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()).await {
        error!("{}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            error!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}
