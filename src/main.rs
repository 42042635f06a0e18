fn main() {
    if let Err(e) = ac_sync::run() {
        log::error!("{}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
