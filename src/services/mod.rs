pub(crate) mod dispatch;
pub(crate) mod grading;
pub(crate) mod print_packages;
pub(crate) mod storage;
pub(crate) mod vision;
