fn main() {
    env_logger::init();

    if let Err(err) = labelpivot::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
