use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hook-runner",
    version,
    about = "Run a command whenever a webhook push arrives",
    long_about = "Listens for webhook pushes and runs the supplied command on arrival, \
                  passing the request body on its stdin. The command is executed with \
                  its arguments exactly as given on the command line.",
    after_help = "Example:\n\n  hook-runner --secret-file ~/.hook-secret -- /home/user/bin/notify.py someone@example.com"
)]
pub(crate) struct Args {
    /// Optional TOML file providing defaults for every option below.
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// Address to listen on [default: 0.0.0.0:8000]
    #[arg(long)]
    pub(crate) address: Option<String>,
    /// File containing the webhook secret used to authenticate requests.
    #[arg(long, conflicts_with = "no_secret")]
    pub(crate) secret_file: Option<PathBuf>,
    /// Directory for the command's captured output [default: /tmp]
    #[arg(long)]
    pub(crate) tmp_dir: Option<PathBuf>,
    /// Run the command from this directory.
    #[arg(long)]
    pub(crate) working_dir: Option<PathBuf>,
    /// Timeout for the command [default: 60]
    #[arg(long)]
    pub(crate) timeout_in_secs: Option<u64>,
    /// Accept signed hooks without a local secret. Without this, signed
    /// hooks are refused when no secret is configured.
    #[arg(long, default_value_t = false)]
    pub(crate) no_secret: bool,
    /// Also write JSON logs to a daily rolling file in this directory.
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Command to run on each hook, followed by its arguments.
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub(crate) command: Vec<String>,
}
