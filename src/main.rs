use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match recovery_core::cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(recovery_core::errors::exit_code(&e))
        }
    }
}
