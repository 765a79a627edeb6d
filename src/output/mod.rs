// Output display window
// Shows read-back composite frames in a native window on its own thread
//
// The engine never depends on this: it is one consumer of the frame tap,
// living entirely outside the render loop.

mod window;

pub use window::{OutputWindow, OutputWindowHandle, OutputWindowEvent};
