fn main() {
    if let Err(err) = subwatch::run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
