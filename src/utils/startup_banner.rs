pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
       _       _                 _
      (_) ___ | |__   __ _  __ _| |_ ___
      | |/ _ \| '_ \ / _` |/ _` | __/ _ \
      | | (_) | |_) | (_| | (_| | ||  __/
     _/ |\___/|_.__/ \__, |\__,_|\__\___|
    |__/             |___/                 "#;
    const APP_DESCRIPTION: &str =
        "Long-polling job activation gateway in front of a partitioned broker.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("JOBGATE_BUILD_DATE_UTC"),
        env!("JOBGATE_BUILD_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
