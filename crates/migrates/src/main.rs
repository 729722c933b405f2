use migrates_core::Registry;

fn main() -> anyhow::Result<()> {
    // The standalone binary ships with an empty registry; applications
    // embed the tool by registering their migrations and calling
    // `migrates::run` themselves.
    migrates::run(Registry::new(), &migrates::NoLoader)
}
