mod integration {
    pub mod common;
    mod property_tests;
}
