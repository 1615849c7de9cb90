fn main() -> anyhow::Result<()> {
    sales_desk_lib::run()
}
