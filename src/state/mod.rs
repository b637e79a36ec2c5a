pub mod operation_window;

pub use operation_window::OperationWindow;
