fn main() -> anyhow::Result<()> {
    exorsus::ex::main()
}
