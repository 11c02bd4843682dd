pub(crate) mod attempts;
pub(crate) mod print_packages;
pub(crate) mod print_uploads;
pub(crate) mod questions;
pub(crate) mod store;
pub(crate) mod users;
