use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colony_save_core::SlotLayout;
use colony_save_engine::{AutoSaveConfig, KNOWN_EVENTS};

/// Configuration for the colony-save command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "colony-save")]
#[command(about = "Manage local and cloud save slots for a colony simulation")]
pub struct Config {
    /// Base directory for save data
    #[arg(long, env = "COLONY_SAVE_DIR")]
    pub save_dir: Option<PathBuf>,

    /// Player profile; each profile has its own slots and lock
    #[arg(long, default_value = "default", env = "COLONY_PROFILE")]
    pub profile: String,

    /// Number of manual slots
    #[arg(long, default_value = "3", env = "COLONY_MANUAL_SLOTS")]
    pub manual_slots: u32,

    /// Number of auto-save slots
    #[arg(long, default_value = "3", env = "COLONY_AUTO_SLOTS")]
    pub auto_slots: u32,

    /// Number of quick-save slots
    #[arg(long, default_value = "1", env = "COLONY_QUICK_SLOTS")]
    pub quick_slots: u32,

    /// Storage quota across all slots, in bytes
    #[arg(long, default_value = "5242880", env = "COLONY_QUOTA_BYTES")]
    pub quota_bytes: u64,

    /// Remote sync base URL
    #[arg(long, env = "COLONY_REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Remote sync API key
    #[arg(long, env = "COLONY_REMOTE_API_KEY", hide_env_values = true)]
    pub remote_api_key: Option<String>,

    /// Account email for remote sync
    #[arg(long, env = "COLONY_EMAIL")]
    pub email: Option<String>,

    /// Account password for remote sync
    #[arg(long, env = "COLONY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List every slot with its occupancy
    Slots,
    /// Show quota usage
    Usage,
    /// Save a snapshot JSON file into a slot
    Save {
        slot: u32,
        /// Snapshot JSON file
        #[arg(long)]
        file: PathBuf,
    },
    /// Load a slot and print (or write) the snapshot
    Load {
        slot: u32,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Empty a slot
    Delete { slot: u32 },
    /// Write a slot's stored record to a file
    Export {
        slot: u32,
        #[arg(long)]
        out: PathBuf,
    },
    /// Import an exported record into a slot
    Import {
        slot: u32,
        #[arg(long)]
        file: PathBuf,
    },
    /// Reconcile local slots with the remote store
    Sync,
    /// Run the auto-save scheduler against a snapshot file until interrupted
    Autosave {
        /// Snapshot JSON file, re-read on every save
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "5")]
        interval_minutes: u32,
        /// Auto slots in the rotation
        #[arg(long, default_value = "3")]
        auto_slots: u32,
        /// Events that trigger a save (default: all known events)
        #[arg(long, value_delimiter = ',')]
        events: Vec<String>,
        /// Upper bound on the final save at shutdown
        #[arg(long, default_value = "10")]
        shutdown_timeout_secs: u64,
    },
}

impl Config {
    /// Get the effective save directory.
    pub fn effective_save_dir(&self) -> PathBuf {
        self.save_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("colony-save")
        })
    }

    /// Directory holding this profile's slot records.
    pub fn profile_dir(&self) -> PathBuf {
        self.effective_save_dir().join(&self.profile)
    }

    pub fn layout(&self) -> SlotLayout {
        SlotLayout {
            manual_slots: self.manual_slots,
            auto_slots: self.auto_slots,
            quick_slots: self.quick_slots,
            quota_bytes: self.quota_bytes,
        }
    }

    /// Auto-save settings from the `autosave` subcommand, if that is the command.
    pub fn auto_save(&self) -> Option<AutoSaveConfig> {
        match &self.command {
            Command::Autosave {
                interval_minutes,
                auto_slots,
                events,
                ..
            } => Some(AutoSaveConfig {
                enabled: true,
                interval_minutes: *interval_minutes,
                auto_slot_count: *auto_slots,
                events: if events.is_empty() {
                    KNOWN_EVENTS.iter().map(|e| e.to_string()).collect()
                } else {
                    events.clone()
                },
            }),
            _ => None,
        }
    }
}
