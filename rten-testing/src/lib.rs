//! Test helpers shared by the rten-fold crates.

use std::fmt::Debug;
use std::panic::RefUnwindSafe;

/// Runs a test function over a table of cases.
///
/// Each case is a value of a `Debug` type, conventionally a struct named
/// `Case`. Every case is run even if earlier ones fail. Once all have run,
/// [`test_each`](TestCases::test_each) panics with the debug representation
/// of each failing case, so a single run reports all broken cases.
///
/// ```
/// use rten_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     shape: Vec<usize>,
///     numel: usize,
/// }
///
/// let cases = [
///     Case { shape: vec![16, 1, 1], numel: 16 },
///     Case { shape: vec![], numel: 1 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.shape.iter().product::<usize>(), case.numel);
/// });
/// ```
///
/// Panics are caught with [`catch_unwind`](std::panic::catch_unwind), so
/// cases and any values captured by the test function must be unwind safe.
/// Cases containing values with interior mutability (eg. `Rc`) should
/// instead describe how to create those values, and create them inside the
/// test function.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call `test` with each case, then panic if any of the calls panicked.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + RefUnwindSafe,
    {
        let failures: Vec<I::Item> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        report_failures(&failures);
    }
}

fn report_failures<T: Debug>(failures: &[T]) {
    if failures.is_empty() {
        return;
    }
    let cases: Vec<String> = failures.iter().map(|case| format!("{:?}", case)).collect();
    panic!(
        "{} test cases failed:\n  {}",
        failures.len(),
        cases.join("\n  ")
    );
}

#[cfg(test)]
mod tests {
    use super::TestCases;

    #[test]
    fn test_each_success() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = vec![Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| assert!(case.x > 0));
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_each_reports_failures() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }, Case { x: -1 }];
        cases.test_each(|case| {
            assert!(case.x < 0, "case should fail");
        })
    }
}
