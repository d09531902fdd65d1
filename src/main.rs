fn main() -> anyhow::Result<()> {
    layoutvm_rust::run()
}
