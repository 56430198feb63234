fn main() -> Result<(), Box<dyn std::error::Error>> {
    relais::cli::main()
}
