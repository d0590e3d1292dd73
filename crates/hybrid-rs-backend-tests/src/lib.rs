pub mod recording_backend;
pub mod smoke;

pub use recording_backend::{CallCounts, RecordingBackend};

/// Expands to a test module running every smoke check against `$backend_ctor()`.
///
/// The constructor is invoked once per test and must return an `Arc` of a type
/// implementing `hybrid_rs::Backend`.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        smoke::$name(backend.as_ref());
                    }
                };
            }

            smoke_test!(elementwise_chain_matches_expected);
            smoke_test!(matmul_matches_expected);
            smoke_test!(split_concat_rotates_columns);
            smoke_test!(transpose_reshape_cast_matches_expected);
            smoke_test!(multiple_results_are_written_in_order);
            smoke_test!(constant_operand_is_folded_into_result);
            smoke_test!(mismatched_input_dtype_is_rejected);
            smoke_test!(wrong_input_count_is_rejected);
            smoke_test!(compile_is_idempotent);
        }
    };
}
