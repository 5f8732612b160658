fn main() {
    hivegate::run();
}
