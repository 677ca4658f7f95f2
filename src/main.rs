fn main() {
    if let Err(err) = deal_recon::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
