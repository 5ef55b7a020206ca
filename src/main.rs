fn main() {
    k8psh::cli::main();
}
