use std::process::ExitCode;

fn main() -> ExitCode {
    match clipper::run() {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(error) => {
            eprintln!("clipper: {error}");
            ExitCode::FAILURE
        }
    }
}
