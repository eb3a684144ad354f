fn main() {
    std::process::exit(repowatch::app::startup::startup());
}
