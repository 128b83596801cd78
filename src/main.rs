fn main() -> anyhow::Result<()> {
    fasttext_serving::run()
}
