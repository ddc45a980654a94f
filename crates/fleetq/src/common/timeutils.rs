use std::time::Duration;

#[macro_export]
macro_rules! arg_wrapper {
    ($name:ident, $wrapped_type:ty, $parser:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name($wrapped_type);

        impl ::std::str::FromStr for $name {
            type Err = ::anyhow::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                ::std::result::Result::Ok(Self($parser(s)?))
            }
        }

        impl $name {
            pub fn get(&self) -> &$wrapped_type {
                &self.0
            }
            pub fn unpack(self) -> $wrapped_type {
                self.0
            }
        }
    };
}

// Allows specifying humantime format (2h, 3m, etc.)
crate::arg_wrapper!(ArgDuration, Duration, humantime::parse_duration);

/// Reads a duration in milliseconds from the given environment variable.
pub fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(not(test))]
pub fn now_monotonic() -> std::time::Instant {
    std::time::Instant::now()
}

#[cfg(test)]
pub use mock_time::now_monotonic;

/// Testing utilities for mocking (monotonic) timestamps.
/// Use the `now_monotonic` function if you want to be able to mock the time in tests.
#[cfg(test)]
pub mod mock_time {
    use std::cell::RefCell;
    use std::time::Instant;

    thread_local! {
        static MOCK_TIME: RefCell<Option<Instant>> = const { RefCell::new(None) };
    }

    pub struct MockTime;

    impl MockTime {
        pub fn mock(time: Instant) -> Self {
            MOCK_TIME.with(|cell| {
                assert!(cell.borrow().is_none());
                *cell.borrow_mut() = Some(time);
            });
            MockTime
        }

        /// Moves the mocked time forward.
        pub fn advance(&self, duration: std::time::Duration) {
            MOCK_TIME.with(|cell| {
                let mut time = cell.borrow_mut();
                let current = time.expect("Time is not mocked");
                *time = Some(current + duration);
            });
        }
    }

    impl Drop for MockTime {
        fn drop(&mut self) {
            MOCK_TIME.with(|cell| *cell.borrow_mut() = None);
        }
    }

    pub fn now_monotonic() -> Instant {
        MOCK_TIME.with(|cell| cell.borrow().as_ref().cloned().unwrap_or_else(Instant::now))
    }
}
