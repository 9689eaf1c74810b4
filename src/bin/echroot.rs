use anyhow::Result;

fn main() -> Result<()> {
    echroot::cli::run()
}
