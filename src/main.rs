fn main() {
    let args = std::env::args();
    if let Err(err) = jailfs::run(args) {
        eprintln!("jailfs error: {err}");
        std::process::exit(1);
    }
}
