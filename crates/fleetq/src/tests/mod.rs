
use log::LevelFilter;

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
