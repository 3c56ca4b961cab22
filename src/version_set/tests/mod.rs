pub mod helpers;
mod tests_commit;
