fn main() {
    let args = std::env::args();

    if let Err(err) = hotbackup::run(args) {
        eprintln!("hotbackup error: {err:#}");
        std::process::exit(1);
    }
}
