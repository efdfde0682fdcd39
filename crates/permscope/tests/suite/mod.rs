mod proxy;
mod resolve;
mod session;
mod transport;
