fn main() {
    match sandbox_command_logs::cli::run_command_logs() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            tracing::error!(error = %err, "sandbox-command-logs failed");
            std::process::exit(1);
        }
    }
}
