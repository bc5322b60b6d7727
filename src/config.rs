use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Remote control for a browser video player
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the backend the extension and the remote controls connect to
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:5000")]
        listen_addr: String,

        /// keep system audio in memory instead of driving the host mixer
        #[arg(long)]
        fake_audio: bool,
    },

    /// Run the extension side: a simulated watch page, its observer and the relay
    Relay {
        #[arg(short, long, default_value = "yt-remote-storage.json")]
        storage: PathBuf,

        /// backend to use instead of the stored one; also written to storage
        #[arg(short, long)]
        backend_url: Option<String>,
    },

    /// Control playback from the terminal
    Remote {
        #[arg(short, long, default_value = "http://localhost:5000")]
        backend_url: String,
    },

    /// Validate, test and store a backend url, like the extension popup
    Configure {
        #[arg(short, long, default_value = "yt-remote-storage.json")]
        storage: PathBuf,

        url: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let args = Args::parse_from(["yt-remote", "serve"]);
        match args.command {
            Command::Serve {
                listen_addr,
                fake_audio,
            } => {
                assert_eq!(listen_addr, "0.0.0.0:5000");
                assert!(!fake_audio);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn configure_takes_a_positional_url() {
        let args = Args::parse_from(["yt-remote", "configure", "http://10.0.0.2:5000"]);
        match args.command {
            Command::Configure { storage, url } => {
                assert_eq!(storage, PathBuf::from("yt-remote-storage.json"));
                assert_eq!(url, "http://10.0.0.2:5000");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
