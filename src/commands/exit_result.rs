use std::{
    error::Error,
    process::{ExitCode, Termination},
};

/// The outcome of a command verb, mapped to a stable process exit code.
pub enum ExitResult<T: Termination> {
    Ok(T),
    Err(Box<dyn Error>, u8),
}

impl<T: Termination> ExitResult<T> {
    pub fn err_from<E: Error + 'static>(e: E, code: u8) -> ExitResult<T> {
        ExitResult::Err(Box::new(e), code)
    }
}

impl<T: Termination> Termination for ExitResult<T> {
    fn report(self) -> ExitCode {
        match self {
            ExitResult::Ok(t) => t.report(),
            ExitResult::Err(e, code) => {
                eprintln!("Error: {}", e);
                code.into()
            }
        }
    }
}
