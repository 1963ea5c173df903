fn main() {
    let exit_code = match falcon::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("falcon: error: {}", err);
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
