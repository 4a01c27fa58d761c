use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Inspect and drive the offline sync queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local store
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Path to a JSON sync config
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Backend base URL (overrides the config file)
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, global = true, value_name = "TOKEN")]
    pub token: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queue, connectivity and conflict status
    Status {
        /// Probe the backend before reporting
        #[arg(long)]
        check: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage queued operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Queue a mutation
    Enqueue {
        #[command(subcommand)]
        command: EnqueueCommands,
    },
    /// Replay the queue against the backend now
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Manage the cached session identity
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List pending operations in execution order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List operations that failed permanently
    Failed {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Acknowledge (and drop) a failed operation
    Ack {
        /// Operation ID
        id: String,
    },
    /// Cancel a pending operation and revert its local change
    Cancel {
        /// Operation ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum EnqueueCommands {
    /// Create an entity
    Create {
        /// Entity kind
        kind: String,
        /// Field values as a JSON object
        #[arg(long, value_name = "JSON")]
        data: String,
        /// Parent entity ID
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    /// Change fields of an entity
    Update {
        /// Entity kind
        kind: String,
        /// Entity ID
        id: String,
        /// Changed fields as a JSON object
        #[arg(long, value_name = "JSON")]
        data: String,
    },
    /// Delete an entity
    Delete {
        /// Entity kind
        kind: String,
        /// Entity ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List outstanding conflicts
    List {
        /// Only conflicts in this scope
        #[arg(long, value_name = "SCOPE")]
        scope: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare pending operations in a scope against the server
    Detect {
        /// Scope (account) to scan
        scope: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one conflict
    Resolve {
        /// Entity ID the conflict is recorded under
        id: String,
        /// Resolution strategy
        #[arg(long, value_enum)]
        strategy: Strategy,
        /// Fields taken from the local side (merge)
        #[arg(long, value_delimiter = ',', value_name = "FIELDS")]
        fields: Vec<String>,
        /// Explicit values as a JSON object (manual)
        #[arg(long, value_name = "JSON")]
        values: Option<String>,
    },
    /// Resolve every conflict with one strategy
    ResolveAll {
        /// Resolution strategy
        #[arg(long, value_enum)]
        strategy: BulkStrategy,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Show the cached identity
    Show,
    /// Cache an identity for offline enqueues
    Set {
        /// Account (scope) ID
        account_id: String,
        /// User ID
        user_id: String,
    },
    /// Forget the cached identity
    Clear,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Strategy {
    KeepLocal,
    KeepServer,
    Merge,
    Manual,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum BulkStrategy {
    KeepLocal,
    KeepServer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
