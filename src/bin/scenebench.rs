fn main() -> anyhow::Result<()> {
    scenebench::cli::run()
}
