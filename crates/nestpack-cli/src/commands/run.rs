//! `nestpack run`: boot the container and invoke its entry module.

use std::path::PathBuf;
use std::process::ExitCode;

use nestpack_runtime::Bootstrap;

pub struct RunArgs {
    pub container: Option<PathBuf>,
    pub entry: Option<String>,
    pub procedure: Option<String>,
    pub report_only: bool,
    pub system_exit: bool,
    pub args: Vec<String>,
}

pub fn execute(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut config = super::config(args.container);
    if args.entry.is_some() {
        config.entry_module = args.entry;
    }
    if let Some(procedure) = args.procedure {
        config.entry_procedure = procedure;
    }
    config.shutdown.report_only |= args.report_only;
    config.shutdown.system_exit |= args.system_exit;

    tracing::debug!(?config, "Launch configuration");

    // Fatal errors are reported by the bootstrap itself.
    let termination = Bootstrap::new(config).launch(&args.args);
    Ok(ExitCode::from(termination.exit_code.clamp(0, 255) as u8))
}
