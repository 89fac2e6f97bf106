use std::time::Duration;

use wrapper_with_default::WrapperWithDefault;

#[test]
fn duration_wrapper_default_and_conversions() {
    const DEFAULT_DURATION: Duration = Duration::from_secs(10);

    #[derive(WrapperWithDefault)]
    #[wrapper_default_value(DEFAULT_DURATION)]
    struct Interval(Duration);

    assert_eq!(Duration::from(Interval::default()), Duration::from_secs(10));

    let interval: Interval = Duration::from_secs(1).into();
    let duration: Duration = interval.into();
    assert_eq!(duration, Duration::from_secs(1));
}

#[test]
fn usize_wrapper_default_and_conversions() {
    const USIZE_DEFAULT: usize = 42;

    #[derive(WrapperWithDefault)]
    #[wrapper_default_value(USIZE_DEFAULT)]
    struct Wrapper(usize);

    assert_eq!(usize::from(Wrapper::default()), 42);

    let wrapper: Wrapper = 10.into();
    assert_eq!(usize::from(wrapper), 10);
}

#[test]
fn bool_wrapper_default_and_conversions() {
    const ENABLED_DEFAULT: bool = true;

    #[derive(WrapperWithDefault)]
    #[wrapper_default_value(ENABLED_DEFAULT)]
    struct Enabled(bool);

    assert!(bool::from(Enabled::default()));
    assert!(!bool::from(Enabled::from(false)));
}
