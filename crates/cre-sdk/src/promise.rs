use std::cell::RefCell;
use std::rc::Rc;

use crate::error::SdkError;

type Thunk<T> = Box<dyn FnOnce() -> Result<T, SdkError>>;

enum State<T> {
  Pending(Thunk<T>),
  Resolving,
  Settled(Result<T, SdkError>),
}

/// A deferred, memoized result.
///
/// The computation behind a promise runs the first time anyone waits on it;
/// every later wait, on this promise or any clone of it, returns the same
/// result without running it again.
pub struct Promise<T> {
  state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Self {
      state: self.state.clone(),
    }
  }
}

impl<T: 'static> Promise<T> {
  pub fn new(compute: impl FnOnce() -> Result<T, SdkError> + 'static) -> Self {
    Self::from_state(State::Pending(Box::new(compute)))
  }

  pub fn resolved(value: T) -> Self {
    Self::from_state(State::Settled(Ok(value)))
  }

  pub fn rejected(error: SdkError) -> Self {
    Self::from_state(State::Settled(Err(error)))
  }

  fn from_state(state: State<T>) -> Self {
    Self {
      state: Rc::new(RefCell::new(state)),
    }
  }
}

impl<T: Clone + 'static> Promise<T> {
  /// Run the computation if it has not run yet and return its result.
  pub fn wait(&self) -> Result<T, SdkError> {
    let compute = {
      let mut state = self.state.borrow_mut();
      match std::mem::replace(&mut *state, State::Resolving) {
        State::Pending(compute) => compute,
        State::Settled(result) => {
          *state = State::Settled(result.clone());
          return result;
        }
        State::Resolving => return Err(SdkError::PromiseReentered),
      }
    };

    let result = compute();
    *self.state.borrow_mut() = State::Settled(result.clone());
    result
  }

  /// Chain a fallible transformation of the resolved value.
  pub fn then<U: 'static>(&self, f: impl FnOnce(T) -> Result<U, SdkError> + 'static) -> Promise<U> {
    let this = self.clone();
    Promise::new(move || f(this.wait()?))
  }

  /// Chain a computation that itself produces a promise.
  pub fn then_promise<U: Clone + 'static>(
    &self,
    f: impl FnOnce(T) -> Promise<U> + 'static,
  ) -> Promise<U> {
    let this = self.clone();
    Promise::new(move || f(this.wait()?).wait())
  }
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;

  use super::*;

  #[test]
  fn test_wait_runs_once() {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let promise = Promise::new(move || {
      counter.set(counter.get() + 1);
      Ok(42)
    });

    assert_eq!(promise.wait(), Ok(42));
    assert_eq!(promise.clone().wait(), Ok(42));
    assert_eq!(calls.get(), 1);
  }

  #[test]
  fn test_errors_are_memoized() {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let promise: Promise<i32> = Promise::new(move || {
      counter.set(counter.get() + 1);
      Err(SdkError::Capability("boom".to_string()))
    });

    assert_eq!(promise.wait(), Err(SdkError::Capability("boom".to_string())));
    assert_eq!(promise.wait(), Err(SdkError::Capability("boom".to_string())));
    assert_eq!(calls.get(), 1);
  }

  #[test]
  fn test_then_chains() {
    let promise = Promise::resolved(20).then(|v| Ok(v + 1));
    assert_eq!(promise.wait(), Ok(21));

    let promise = Promise::resolved(2).then_promise(|v| Promise::resolved(v * 10));
    assert_eq!(promise.wait(), Ok(20));

    let promise = Promise::<i32>::rejected(SdkError::CallIdsExhausted).then(|v| Ok(v + 1));
    assert_eq!(promise.wait(), Err(SdkError::CallIdsExhausted));
  }

  #[test]
  fn test_reentrant_wait() {
    let slot: Rc<RefCell<Option<Promise<i32>>>> = Rc::new(RefCell::new(None));
    let inner = slot.clone();
    let promise = Promise::new(move || match inner.borrow().as_ref() {
      Some(p) => p.wait(),
      None => Ok(0),
    });
    *slot.borrow_mut() = Some(promise.clone());

    assert_eq!(promise.wait(), Err(SdkError::PromiseReentered));
  }
}
